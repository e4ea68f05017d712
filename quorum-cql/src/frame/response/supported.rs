use crate::frame::frame_errors::ResponseParseCause;
use crate::frame::request::options;
use crate::frame::types;
use crate::frame::Compression;
use std::collections::HashMap;

/// Answer to OPTIONS: every STARTUP option the server accepts, with its allowed values.
#[derive(Debug, Default)]
pub struct Supported {
    pub options: HashMap<String, Vec<String>>,
}

impl Supported {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ResponseParseCause> {
        let options =
            types::read_string_multimap(buf).map_err(ResponseParseCause::field("options"))?;

        Ok(Supported { options })
    }

    /// Whether the server lists `compression` among its COMPRESSION values.
    pub fn supports_compression(&self, compression: Compression) -> bool {
        self.options
            .get(options::COMPRESSION)
            .is_some_and(|algs| algs.iter().any(|alg| alg == compression.as_str()))
    }
}

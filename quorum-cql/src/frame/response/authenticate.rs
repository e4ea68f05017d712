use crate::frame::frame_errors::ResponseParseCause;
use crate::frame::types;

/// Server requires authentication, naming its authenticator class.
#[derive(Debug)]
pub struct Authenticate {
    pub authenticator_name: String,
}

impl Authenticate {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ResponseParseCause> {
        let authenticator_name = types::read_string(buf)
            .map_err(ResponseParseCause::field("authenticator_name"))?
            .to_string();

        Ok(Authenticate { authenticator_name })
    }
}

#[derive(Debug)]
pub struct AuthSuccess {
    pub success_message: Option<Vec<u8>>,
}

impl AuthSuccess {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ResponseParseCause> {
        let success_message = types::read_bytes_opt(buf)
            .map_err(ResponseParseCause::field("success_message"))?
            .map(ToOwned::to_owned);

        Ok(AuthSuccess { success_message })
    }
}

#[derive(Debug)]
pub struct AuthChallenge {
    pub authenticate_message: Option<Vec<u8>>,
}

impl AuthChallenge {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ResponseParseCause> {
        let authenticate_message = types::read_bytes_opt(buf)
            .map_err(ResponseParseCause::field("authenticate_message"))?
            .map(|b| b.to_owned());

        Ok(AuthChallenge {
            authenticate_message,
        })
    }
}

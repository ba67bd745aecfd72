use crate::event_loop::MultiplexError;
use crate::mqtt_service::MqttError;
use crate::rest_client::RestError;
use crate::rest_server::ServerError;
use thiserror::Error;

/// Why a unit worker ended before shutdown was requested.
#[derive(Debug, Error)]
pub enum UnitError {
    #[error(transparent)]
    Mqtt(#[from] MqttError),
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error(transparent)]
    Multiplex(#[from] MultiplexError),
    #[error(transparent)]
    Rest(#[from] RestError),
}

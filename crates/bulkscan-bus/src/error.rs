use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("failed to serialize job: {0}")]
    Serialize(String),

    #[error("failed to deserialize delivery: {0}")]
    Deserialize(String),

    #[error("consumer stream ended")]
    ConsumerClosed,
}

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] bulkscan_core::Error),

    #[error(transparent)]
    Bus(#[from] bulkscan_bus::Error),

    #[error(transparent)]
    Store(#[from] bulkscan_store::Error),
}

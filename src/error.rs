use thiserror::Error;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum Error {
    #[error("All work-item slots are taken")]
    QueueFull,
    #[error("Buffer too small")]
    BufferTooSmall,
    #[error("Cannot parse string as the given type")]
    Parse,
    #[error("Text is not valid UTF-8")]
    StringEncoding,
}

use crate::registry::Position;

/// Rejections reported back to the caller of a hub command. None of these
/// mutate hub state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    #[error("plant '{0}' already exists")]
    DuplicatePlant(String),
    #[error("plant name is empty")]
    EmptyPlantName,
    #[error("device {0} not found")]
    UnknownDevice(u64),
    #[error("plant index {0} does not exist")]
    UnknownPlant(u32),
    #[error("position {0} cannot be assigned (use X, Y or Z)")]
    UnassignablePosition(Position),
    #[error("cycle duration must be between 1s and one year, got {0}s")]
    InvalidDuration(i64),
    #[error("plant catalog has no free index left")]
    CatalogFull,
    #[error("hub is not running")]
    Stopped,
}

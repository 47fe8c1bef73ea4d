use archivist_types::ArchiveKey;

/// Buffered events per subscriber before slow receivers start lagging.
pub(crate) const EVENT_CAPACITY: usize = 256;

/// Lifecycle notifications published by the
/// [`ArchiveRegistry`](crate::ArchiveRegistry).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryEvent {
    /// The archive became resident.
    Loaded { key: ArchiveKey, replicating: bool },
    /// A load settled with an error; the key is absent again.
    LoadFailed { key: ArchiveKey, reason: String },
    /// The archive was closed and removed from the registry.
    Closed { key: ArchiveKey },
}

impl RegistryEvent {
    pub fn key(&self) -> &ArchiveKey {
        match self {
            Self::Loaded { key, .. } | Self::LoadFailed { key, .. } | Self::Closed { key } => key,
        }
    }
}

/// Canvas node identifier. Node ids are user-facing strings (e.g. `"A"`, `"12"`).
pub type NodeId = String;

/// Backend (render worker) identifier.
pub type BackendId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

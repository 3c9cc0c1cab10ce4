// -
// Database namespaces

/// Sled database tree namespaces
pub(crate) const DATA_TREE: &str = "_kv_data";
pub(crate) const META_TREE: &str = "_kv_meta";

/// Sled entry key namespaces
pub(crate) const META_KEY_APPLIED_INDEX: &str = "_applied_index";
pub(crate) const META_KEY_APPLIED_TERM: &str = "_applied_term";
pub(crate) const META_KEY_CLUSTER_CONFIG: &str = "_cluster_config";

/// Node identity file, generated on first start and reused across restarts
pub(crate) const NODE_ID_FILE: &str = "node-id";

/// Command size ceiling applied before submission to the consensus engine
pub(crate) const DEFAULT_MAX_COMMAND_SIZE_BYTES: usize = 32 * 1024;

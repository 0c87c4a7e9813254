//! redb table definitions for the Tidescale state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Policy records keyed by `{namespace}/{name}`.
pub const POLICIES: TableDefinition<&str, &[u8]> = TableDefinition::new("policies");

/// Credential secrets keyed by `{namespace}/{name}`.
pub const SECRETS: TableDefinition<&str, &[u8]> = TableDefinition::new("secrets");

/// Serving node counts keyed by `{project}/{instance}/{cluster}`.
pub const CLUSTERS: TableDefinition<&str, &[u8]> = TableDefinition::new("clusters");

/// Utilization samples keyed by `{project}:{timestamp:020}`.
///
/// The zero-padded timestamp keeps a project's samples in time order.
pub const UTILIZATION: TableDefinition<&str, &[u8]> = TableDefinition::new("utilization");

//! redb table definitions for the broker state store.

use redb::TableDefinition;

/// Every record lives in one table keyed by its `/`-separated path
/// (`/spec/{id}`, `/state/{instance}/job/{token}`, ...). Values are the
/// JSON-encoded record.
pub const KV: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");

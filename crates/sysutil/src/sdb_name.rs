//! Snapshot dump (SDB) filename generation.

/// Minimum buffer size needed for an sdb filename without a prefix.
///
/// A 64-bit id is at most 20 decimal digits; prefix length must be added on
/// top by callers that size their own buffers.
pub const SDB_NAME_MIN_BUF_SIZE: usize = 20 + ".sdb".len();

/// Generates an sdb filename of the form `[prefix-]<id>.sdb`.
pub fn sdb_name(prefix: Option<&str>, id: u64) -> String {
    match prefix {
        Some(prefix) => format!("{prefix}-{id}.sdb"),
        None => format!("{id}.sdb"),
    }
}

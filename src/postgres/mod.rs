// ABOUTME: PostgreSQL control-plane access: connections and prerequisite checks
// ABOUTME: Slot and table-scan implementations live beside their seams in slot/ and snapshot/

pub mod connection;
pub mod privileges;

pub use connection::{connect, connect_with_retry};
pub use privileges::{
    check_source_privileges, check_table_select_permissions, check_wal_level, PrivilegeCheck,
    TablePermissionCheck,
};

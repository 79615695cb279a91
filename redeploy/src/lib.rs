//! redeploy library
//!
//! Backup, update and rollback sequencing for git-deployed services run by
//! systemd.

pub mod app;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod identity;
pub mod logs;
pub mod storage;
pub mod utils;

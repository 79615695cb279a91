//! Integration tests

mod test_backup;
mod test_sequencer;
mod test_settings;

//! Shared fixtures for SSH transport tests.

use rstest::fixture;

use super::super::*;

#[fixture]
pub fn base_config() -> SshConfig {
    SshConfig {
        ssh_bin: String::from("ssh"),
        host: Some(String::from("win01.example.test")),
        port: 2222,
        user: String::from("Administrator"),
        identity_file: Some(String::from("/keys/id_ed25519")),
        batch_mode: true,
        strict_host_key_checking: false,
        known_hosts_file: String::from("/dev/null"),
        control_dir: String::from("/run/shellpool"),
        connect_timeout_secs: 5,
    }
}

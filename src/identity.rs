//! Sender identity carried in every message envelope.
//!
//! The collector keys its client registry on the machine fingerprint, so
//! the fingerprint must be stable across restarts and reinstalls of the
//! agent. Client name and OS version are informational and may change.

use std::fs;

/// Operating system family of a sender.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum OsKind {
    Windows,
    Linux,
    #[default]
    Other,
}

impl OsKind {
    pub fn current() -> Self {
        if cfg!(windows) {
            OsKind::Windows
        } else if cfg!(target_os = "linux") {
            OsKind::Linux
        } else {
            OsKind::Other
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            OsKind::Windows => 0,
            OsKind::Linux => 1,
            OsKind::Other => 2,
        }
    }

    /// Unknown wire values collapse to `Other`.
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => OsKind::Windows,
            1 => OsKind::Linux,
            _ => OsKind::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OsKind::Windows => "Windows",
            OsKind::Linux => "Linux",
            OsKind::Other => "Other",
        }
    }
}

/// Who sent a message: name, platform and stable machine fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct Identity {
    pub client_name: String,
    pub os_kind: OsKind,
    pub os_version: String,
    pub machine_id: String,
}

impl Identity {
    pub fn new(
        client_name: impl Into<String>,
        os_kind: OsKind,
        os_version: impl Into<String>,
        machine_id: impl Into<String>,
    ) -> Self {
        Self {
            client_name: client_name.into(),
            os_kind,
            os_version: os_version.into(),
            machine_id: machine_id.into(),
        }
    }

    /// Identity of the local host. `client_name` overrides the device name.
    pub fn local(client_name: Option<&str>) -> Self {
        let device = whoami::devicename();
        let distro = whoami::distro();
        let machine_id = machine_fingerprint(&device, &distro);

        Self {
            client_name: client_name.map(str::to_string).unwrap_or(device),
            os_kind: OsKind::current(),
            os_version: distro,
            machine_id,
        }
    }
}

/// Hex BLAKE3 of the host machine id, or of device name and distro when
/// no machine id is available.
fn machine_fingerprint(device: &str, distro: &str) -> String {
    let source = ["/etc/machine-id", "/var/lib/dbus/machine-id"]
        .iter()
        .find_map(|path| {
            fs::read_to_string(path)
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
        .unwrap_or_else(|| format!("{}\n{}", device, distro));

    hex::encode(blake3::hash(source.as_bytes()).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_kind_wire_values() {
        for kind in [OsKind::Windows, OsKind::Linux, OsKind::Other] {
            assert_eq!(OsKind::from_u8(kind.as_u8()), kind);
        }
        assert_eq!(OsKind::from_u8(200), OsKind::Other);
    }

    #[test]
    fn test_local_identity_is_stable() {
        let a = Identity::local(None);
        let b = Identity::local(None);
        assert_eq!(a.machine_id, b.machine_id);
        assert_eq!(a.machine_id.len(), 64);
    }

    #[test]
    fn test_client_name_override() {
        let id = Identity::local(Some("build-agent-7"));
        assert_eq!(id.client_name, "build-agent-7");
    }
}

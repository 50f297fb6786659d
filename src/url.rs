//! Peer operand parsing: `[password@]host[:port]/instance`.

pub const DEFAULT_PORT: u16 = 7963;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSpec {
    pub password: String,
    pub host: String,
    pub port: u16,
    pub instance: String,
}

/// Returns `None` when the operand is a plain local path. An operand is only
/// considered remote when it carries an `@` or a `:<digits>` marker, so bare
/// relative paths with slashes stay local.
pub fn parse_remote(s: &str) -> Option<RemoteSpec> {
    if !looks_remote(s) {
        return None;
    }
    // A leading '@' cannot start a credential, so it belongs to the host.
    let (password, rest) = match s.split_once('@') {
        Some(("", _)) | None => ("", s),
        Some((password, rest)) => (password, rest),
    };
    let (host_port, instance) = rest.split_once('/')?;
    if instance.is_empty() || instance.contains('/') {
        return None;
    }
    let (host, port) = match host_port.split_once(':') {
        Some((host, digits)) => {
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            (host, digits.parse::<u16>().ok()?)
        }
        None => (host_port, DEFAULT_PORT),
    };
    if host.is_empty() {
        return None;
    }
    Some(RemoteSpec {
        password: password.to_string(),
        host: host.to_string(),
        port,
        instance: instance.to_string(),
    })
}

fn looks_remote(s: &str) -> bool {
    if s.contains('@') {
        return true;
    }
    s.as_bytes()
        .windows(2)
        .any(|w| w[0] == b':' && w[1].is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_form() {
        let spec = parse_remote("hunter2@backup.example.com:8022/media").unwrap();
        assert_eq!(spec.password, "hunter2");
        assert_eq!(spec.host, "backup.example.com");
        assert_eq!(spec.port, 8022);
        assert_eq!(spec.instance, "media");
    }

    #[test]
    fn password_without_port_gets_default() {
        let spec = parse_remote("pw@10.0.0.5/default").unwrap();
        assert_eq!(spec.port, DEFAULT_PORT);
        assert_eq!(spec.password, "pw");
    }

    #[test]
    fn port_without_password() {
        let spec = parse_remote("host:7963/data").unwrap();
        assert_eq!(spec.password, "");
        assert_eq!(spec.host, "host");
        assert_eq!(spec.port, 7963);
    }

    #[test]
    fn bare_paths_are_local() {
        assert!(parse_remote("some/dir").is_none());
        assert!(parse_remote("/abs/path").is_none());
        assert!(parse_remote("./rel").is_none());
        assert!(parse_remote("file.txt").is_none());
    }

    #[test]
    fn colon_without_digits_is_local() {
        // e.g. Windows drive-letter-like or odd names never trip the gate.
        assert!(parse_remote("weird:name/path").is_none());
    }

    #[test]
    fn remote_marker_with_bad_shape_is_rejected() {
        assert!(parse_remote("host:123").is_none()); // no instance
        assert!(parse_remote("host:123/").is_none()); // empty instance
        assert!(parse_remote("host:123/a/b").is_none()); // nested instance
        assert!(parse_remote("pw@host:12x/inst").is_none()); // non-digit port
        assert!(parse_remote("host:999999/inst").is_none()); // port overflow
    }

    #[test]
    fn instance_name_with_dots_and_dashes() {
        let spec = parse_remote("host:7963/my-backup.v2").unwrap();
        assert_eq!(spec.instance, "my-backup.v2");
    }
}

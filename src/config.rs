use crate::address::Address;

/// Validated startup configuration. Parsing address literals and rejecting
/// incomplete combinations happens once here, outside the relay's hot path;
/// the relay engine only ever sees already-valid `Address` values.
pub struct Config {
    pub listen: Address,
    pub destination: Address,
    /// Local bind endpoint used for every per-flow upstream socket. When the
    /// operator doesn't pin one, this defaults to the wildcard address in
    /// the destination's family, port 0 (ephemeral).
    pub bind_template: Address,
}

impl Config {
    pub fn new(
        listen_ip: &str,
        listen_port: u16,
        destination_ip: &str,
        destination_port: u16,
        source_bind: Option<(&str, u16)>,
    ) -> eyre::Result<Self> {
        let listen = Address::parse(listen_ip, listen_port)?;
        let destination = Address::parse(destination_ip, destination_port)?;
        let bind_template = match source_bind {
            Some((ip, port)) => Address::parse(ip, port)?,
            None => Address::unspecified(destination.is_v6()),
        };
        Ok(Config {
            listen,
            destination,
            bind_template,
        })
    }

    /// A nonzero bind-template port pins every flow to the same source
    /// port — only one flow can hold it at a time.
    pub fn has_pinned_source_port(&self) -> bool {
        self.bind_template.port() != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_bind_template_is_wildcard_matching_destination_family() {
        let cfg = Config::new("127.0.0.1", 5000, "127.0.0.1", 5001, None).unwrap();
        assert!(!cfg.bind_template.is_v6());
        assert_eq!(cfg.bind_template.port(), 0);
        assert!(!cfg.has_pinned_source_port());

        let cfg = Config::new("::1", 5000, "::1", 5001, None).unwrap();
        assert!(cfg.bind_template.is_v6());
    }

    #[test]
    fn explicit_source_bind_with_port_is_pinned() {
        let cfg = Config::new(
            "127.0.0.1",
            5000,
            "127.0.0.1",
            5001,
            Some(("127.0.0.1", 7777)),
        )
        .unwrap();
        assert!(cfg.has_pinned_source_port());
        assert_eq!(cfg.bind_template.port(), 7777);
    }

    #[test]
    fn rejects_invalid_literal() {
        assert!(Config::new("not-an-ip", 5000, "127.0.0.1", 5001, None).is_err());
    }
}

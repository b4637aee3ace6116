//! WireGuard textual configuration parsing.
//!
//! The daemon accepts standard `wg-quick`-style files (plus the scalar keys
//! recognised by obfuscation extensions such as AmneziaWG, which are passed
//! through untouched) and turns them into the `key=value` control stream the
//! transport library consumes. The `public_key=` line is emitted first for
//! each peer; the control stream is rejected by the engine otherwise.

use std::fmt::Write as _;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WgConfig {
    pub interface: WgInterface,
    pub peers: Vec<WgPeer>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WgInterface {
    pub private_key: String,
    pub addresses: Vec<String>,
    pub dns: Vec<IpAddr>,
    pub mtu: Option<u16>,
    pub listen_port: Option<u16>,
    /// Scalar keys we do not interpret (obfuscation extensions), in file
    /// order.
    pub extra: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WgPeer {
    pub public_key: String,
    pub preshared_key: Option<String>,
    pub endpoint: Option<String>,
    pub allowed_ips: Vec<String>,
    pub persistent_keepalive: Option<u16>,
    pub extra: Vec<(String, String)>,
}

#[derive(Debug, thiserror::Error)]
pub enum WgParseError {
    #[error("key '{0}' appears before any section header")]
    KeyOutsideSection(String),
    #[error("line {0} is not 'Key = Value'")]
    MalformedLine(usize),
    #[error("unknown section '[{0}]'")]
    UnknownSection(String),
    #[error("[Interface] section is missing a PrivateKey")]
    MissingPrivateKey,
    #[error("[Peer] section is missing a PublicKey")]
    MissingPublicKey,
    #[error("'{key}' is not a valid curve25519 key")]
    InvalidKey { key: String },
    #[error("invalid {key} value '{value}'")]
    InvalidValue { key: String, value: String },
}

#[derive(PartialEq)]
enum Section {
    None,
    Interface,
    Peer,
}

pub fn parse(text: &str) -> Result<WgConfig, WgParseError> {
    // A UTF-8 BOM at the head of file is tolerated.
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);

    let mut config = WgConfig::default();
    let mut section = Section::None;

    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();

        if line.is_empty() || line.starts_with(['#', ';', '@']) {
            continue;
        }

        if let Some(header) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            section = match header.to_lowercase().as_str() {
                "interface" => Section::Interface,
                "peer" => {
                    config.peers.push(WgPeer::default());
                    Section::Peer
                }
                other => return Err(WgParseError::UnknownSection(other.to_owned())),
            };
            continue;
        }

        let (key, value) = line
            .split_once('=')
            .ok_or(WgParseError::MalformedLine(line_no + 1))?;
        let key = key.trim();
        let value = value.trim();

        match section {
            Section::None => return Err(WgParseError::KeyOutsideSection(key.to_owned())),
            Section::Interface => parse_interface_key(&mut config.interface, key, value)?,
            Section::Peer => {
                let peer = config
                    .peers
                    .last_mut()
                    .expect("peer section pushes an entry");

                parse_peer_key(peer, key, value)?;
            }
        }
    }

    if config.interface.private_key.is_empty() {
        return Err(WgParseError::MissingPrivateKey);
    }

    for peer in &config.peers {
        if peer.public_key.is_empty() {
            return Err(WgParseError::MissingPublicKey);
        }
    }

    Ok(config)
}

fn parse_interface_key(
    interface: &mut WgInterface,
    key: &str,
    value: &str,
) -> Result<(), WgParseError> {
    match key.to_lowercase().as_str() {
        "privatekey" => {
            validate_key(value)?;
            interface.private_key = value.to_owned();
        }
        "address" => {
            interface
                .addresses
                .extend(value.split(',').map(|a| a.trim().to_owned()));
        }
        "dns" => {
            for server in value.split(',') {
                let server = server.trim();
                let addr = server.parse().map_err(|_| WgParseError::InvalidValue {
                    key: "DNS".to_owned(),
                    value: server.to_owned(),
                })?;

                interface.dns.push(addr);
            }
        }
        "mtu" => {
            interface.mtu = Some(parse_number(key, value)?);
        }
        "listenport" => {
            interface.listen_port = Some(parse_number(key, value)?);
        }
        _ => {
            // Obfuscation extensions (Jc, Jmin, S1, H1, ...) ride through.
            interface
                .extra
                .push((key.to_lowercase(), value.to_owned()));
        }
    }

    Ok(())
}

fn parse_peer_key(peer: &mut WgPeer, key: &str, value: &str) -> Result<(), WgParseError> {
    match key.to_lowercase().as_str() {
        "publickey" => {
            validate_key(value)?;
            peer.public_key = value.to_owned();
        }
        "presharedkey" => {
            validate_key(value)?;
            peer.preshared_key = Some(value.to_owned());
        }
        "endpoint" => {
            peer.endpoint = Some(value.to_owned());
        }
        "allowedips" => {
            peer.allowed_ips
                .extend(value.split(',').map(|a| a.trim().to_owned()));
        }
        "persistentkeepalive" => {
            peer.persistent_keepalive = Some(parse_number(key, value)?);
        }
        _ => {
            peer.extra.push((key.to_lowercase(), value.to_owned()));
        }
    }

    Ok(())
}

fn parse_number(key: &str, value: &str) -> Result<u16, WgParseError> {
    value.parse().map_err(|_| WgParseError::InvalidValue {
        key: key.to_owned(),
        value: value.to_owned(),
    })
}

fn validate_key(value: &str) -> Result<(), WgParseError> {
    let decoded = BASE64
        .decode(value)
        .map_err(|_| WgParseError::InvalidKey {
            key: value.to_owned(),
        })?;

    if decoded.len() != 32 {
        return Err(WgParseError::InvalidKey {
            key: value.to_owned(),
        });
    }

    Ok(())
}

impl WgConfig {
    /// Renders the binary control stream for the transport library.
    ///
    /// Within each peer block `public_key=` comes first; the engine treats it
    /// as the start of a new peer.
    pub fn to_control_stream(&self) -> String {
        let mut out = String::new();

        let _ = writeln!(out, "private_key={}", to_hex(&self.interface.private_key));

        if let Some(port) = self.interface.listen_port {
            let _ = writeln!(out, "listen_port={port}");
        }

        for (key, value) in &self.interface.extra {
            let _ = writeln!(out, "{key}={value}");
        }

        let _ = writeln!(out, "replace_peers=true");

        for peer in &self.peers {
            let _ = writeln!(out, "public_key={}", to_hex(&peer.public_key));

            if let Some(psk) = &peer.preshared_key {
                let _ = writeln!(out, "preshared_key={}", to_hex(psk));
            }

            if let Some(endpoint) = &peer.endpoint {
                let _ = writeln!(out, "endpoint={endpoint}");
            }

            if let Some(keepalive) = peer.persistent_keepalive {
                let _ = writeln!(out, "persistent_keepalive_interval={keepalive}");
            }

            let _ = writeln!(out, "replace_allowed_ips=true");

            for allowed in &peer.allowed_ips {
                let _ = writeln!(out, "allowed_ip={allowed}");
            }

            for (key, value) in &peer.extra {
                let _ = writeln!(out, "{key}={value}");
            }
        }

        out
    }

    /// The interface's first IPv4 address (the adapter IP inside the tunnel).
    pub fn ipv4_address(&self) -> Option<Ipv4Addr> {
        self.interface.addresses.iter().find_map(|address| {
            let ip = address.split('/').next()?;

            ip.trim().parse().ok()
        })
    }

    /// All numeric peer endpoints, for bypass-route installation.
    pub fn server_endpoints(&self) -> Vec<SocketAddrV4> {
        self.peers
            .iter()
            .filter_map(|peer| peer.endpoint.as_deref()?.parse().ok())
            .collect()
    }

    /// The largest keepalive interval across peers, for stall detection.
    pub fn keepalive(&self) -> Option<u16> {
        self.peers
            .iter()
            .filter_map(|peer| peer.persistent_keepalive)
            .max()
    }
}

fn to_hex(base64_key: &str) -> String {
    let decoded = BASE64.decode(base64_key).unwrap_or_default();

    decoded.iter().fold(String::new(), |mut out, byte| {
        let _ = write!(out, "{byte:02x}");
        out
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // Throwaway keys generated for the tests.
    const PRIVATE: &str = "yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=";
    const PUBLIC: &str = "xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=";
    const PSK: &str = "FpCyhws9cxwWoV4xELtfJvjJN+zQVRPISllRWgeopVE=";

    fn sample() -> String {
        format!(
            "[Interface]\n\
             PrivateKey = {PRIVATE}\n\
             Address = 10.8.0.2/32\n\
             DNS = 1.1.1.1, 8.8.8.8\n\
             MTU = 1420\n\
             Jc = 4\n\
             \n\
             # upstream exit\n\
             [Peer]\n\
             PublicKey = {PUBLIC}\n\
             PresharedKey = {PSK}\n\
             Endpoint = 198.51.100.7:51820\n\
             AllowedIPs = 0.0.0.0/0\n\
             PersistentKeepalive = 25\n"
        )
    }

    #[test]
    fn parses_a_complete_config() {
        let config = parse(&sample()).unwrap();

        assert_eq!(config.interface.private_key, PRIVATE);
        assert_eq!(config.interface.mtu, Some(1420));
        assert_eq!(config.interface.dns.len(), 2);
        assert_eq!(config.ipv4_address(), Some(Ipv4Addr::new(10, 8, 0, 2)));
        assert_eq!(
            config.server_endpoints(),
            vec!["198.51.100.7:51820".parse::<SocketAddrV4>().unwrap()]
        );
        assert_eq!(config.keepalive(), Some(25));
    }

    #[test]
    fn tolerates_bom_and_comment_styles() {
        let text = format!(
            "\u{feff}# comment\n; another\n@ annotation\n[Interface]\nPrivateKey = {PRIVATE}\n"
        );

        let config = parse(&text).unwrap();

        assert_eq!(config.interface.private_key, PRIVATE);
    }

    #[test]
    fn unknown_scalars_ride_through() {
        let config = parse(&sample()).unwrap();

        assert_eq!(
            config.interface.extra,
            vec![("jc".to_owned(), "4".to_owned())]
        );

        let control = config.to_control_stream();
        assert!(control.contains("jc=4\n"));
    }

    #[test]
    fn control_stream_emits_public_key_first_per_peer() {
        let config = parse(&sample()).unwrap();
        let control = config.to_control_stream();

        let peer_block = control
            .split("replace_peers=true\n")
            .nth(1)
            .expect("control stream has a peer block");

        assert!(peer_block.starts_with("public_key="));
        assert!(peer_block.contains("endpoint=198.51.100.7:51820"));
        assert!(peer_block.contains("persistent_keepalive_interval=25"));
        assert!(peer_block.contains("allowed_ip=0.0.0.0/0"));
    }

    #[test]
    fn keys_are_hex_in_the_control_stream() {
        let config = parse(&sample()).unwrap();
        let control = config.to_control_stream();

        let private_hex = control
            .lines()
            .find_map(|l| l.strip_prefix("private_key="))
            .unwrap();

        assert_eq!(private_hex.len(), 64);
        assert!(private_hex.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn rejects_missing_private_key() {
        assert!(matches!(
            parse("[Interface]\nAddress = 10.0.0.2/32\n"),
            Err(WgParseError::MissingPrivateKey)
        ));
    }

    #[test]
    fn rejects_peer_without_public_key() {
        let text = format!("[Interface]\nPrivateKey = {PRIVATE}\n[Peer]\nEndpoint = 1.2.3.4:51820\n");

        assert!(matches!(
            parse(&text),
            Err(WgParseError::MissingPublicKey)
        ));
    }

    #[test]
    fn rejects_garbage_key_material() {
        assert!(matches!(
            parse("[Interface]\nPrivateKey = not-base64!\n"),
            Err(WgParseError::InvalidKey { .. })
        ));
    }

    #[test]
    fn rejects_key_outside_section() {
        assert!(matches!(
            parse("PrivateKey = whatever\n"),
            Err(WgParseError::KeyOutsideSection(_))
        ));
    }
}

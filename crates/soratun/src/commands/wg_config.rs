//! `soratun wg-config`: print the config as a WireGuard file.

use arc_netstack::Config;
use std::io::{self, Write};

pub fn run<W: Write>(config: &Config, out: &mut W) -> io::Result<()> {
    write!(out, "{}", config)?;
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prints_wireguard_config() {
        let config = Config::from_json(
            r#"{
                "privateKey": "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=",
                "arcSessionStatus": {
                    "arcServerPeerPublicKey": "AQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQE=",
                    "arcServerEndpoint": "198.51.100.7:11010",
                    "arcAllowedIPs": ["100.127.0.0/16"],
                    "arcClientPeerIpAddress": "10.150.0.12"
                }
            }"#,
        )
        .unwrap();

        let mut out = Vec::new();
        run(&config, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.contains("[Interface]"));
        assert!(text.contains("[Peer]"));
        assert!(text.contains("Endpoint = 198.51.100.7:11010"));
    }
}

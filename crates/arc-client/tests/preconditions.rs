use arc_client::{Error, FixedEndpointHttpClient, HttpClient, Network, RawClient};
use arc_netstack::{ArcSession, Config, Key};
use std::net::Ipv4Addr;

fn config_without_session() -> Config {
    Config {
        private_key: Key::new([7u8; 32]),
        public_key: None,
        sim_id: Some("8942310022000012345".into()),
        mtu: 1420,
        log_level: 0,
        persistent_keepalive: None,
        arc_session: None,
    }
}

fn config_with_session() -> Config {
    let mut config = config_without_session();
    config.arc_session = Some(ArcSession {
        arc_server_peer_public_key: Key::new([9u8; 32]).public_key(),
        arc_server_endpoint: "127.0.0.1:9".into(),
        arc_allowed_ips: vec!["100.127.0.0/16".into()],
        arc_client_peer_ip_address: Ipv4Addr::new(10, 150, 0, 12),
    });
    config
}

#[tokio::test]
async fn test_every_constructor_requires_a_session() {
    let config = config_without_session();

    let raw = RawClient::connect(&config, Network::Tcp, "100.127.69.42:80", None).await;
    assert!(matches!(raw, Err(Error::Precondition(_))));

    let http = HttpClient::new(&config, "http://example.com/", vec![]).await;
    assert!(matches!(http, Err(Error::Precondition(_))));

    let fixed = FixedEndpointHttpClient::new(&config, vec![]).await;
    assert!(matches!(fixed, Err(Error::Precondition(_))));
}

#[tokio::test]
async fn test_session_check_comes_before_url_validation() {
    let config = config_without_session();
    let http = HttpClient::new(&config, "not a url", vec![]).await;
    assert!(matches!(http, Err(Error::Precondition(_))));
}

#[tokio::test]
async fn test_clients_build_and_close_their_tunnel() {
    let config = config_with_session();

    let http = HttpClient::new(&config, "http://example.com/path?q=1", vec![])
        .await
        .unwrap();
    assert_eq!(http.request_url(), "http://example.com:80/path?q=1");
    http.close();

    let mut fixed = FixedEndpointHttpClient::new(&config, vec!["X-A: 1".into()])
        .await
        .unwrap();
    fixed.set_verbose(true);
    assert!(fixed.verbose());
    assert_eq!(fixed.headers(), ["X-A: 1".to_string()]);
    fixed.close();
}

#[tokio::test]
async fn test_invalid_url_is_rejected_before_tunnel() {
    let config = config_with_session();
    let http = HttpClient::new(&config, "ftp://example.com/", vec![]).await;
    assert!(matches!(http, Err(Error::InvalidUrl(_))));
}

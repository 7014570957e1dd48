use ghosttype_server::model::ProfileConfig;
use ghosttype_server::{build_app, config, logging, resolve_base_dir};

/// Parses `--host <value>` / `--port <value>` overrides; a bare value on
/// the command line wins over whatever the config file holds.
fn parse_overrides(args: impl Iterator<Item = String>) -> (Option<String>, Option<u16>) {
    let mut host = None;
    let mut port = None;
    let mut args = args.peekable();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--host" => host = args.next(),
            "--port" => port = args.next().and_then(|v| v.parse().ok()),
            _ => {}
        }
    }

    (host, port)
}

#[tokio::main]
async fn main() {
    let base_dir = resolve_base_dir();
    let server_config = config::load_config(&base_dir);

    logging::init_logging(&base_dir, &server_config.log_level);

    let (host_override, port_override) = parse_overrides(std::env::args().skip(1));
    let host = host_override.unwrap_or(server_config.host.clone());
    let port = port_override.unwrap_or(server_config.port);

    let profile_config = ProfileConfig::default();
    let app = build_app(&base_dir, &profile_config);

    let addr = format!("{host}:{port}");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "failed to bind address");
            std::process::exit(1);
        }
    };

    tracing::info!(addr = %addr, "Server ready | 服务已就绪");

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "server loop exited with an error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_overrides_should_read_both_flags() {
        let args = vec!["--host".to_string(), "127.0.0.1".to_string(), "--port".to_string(), "9100".to_string()];
        let (host, port) = parse_overrides(args.into_iter());
        assert_eq!(host.as_deref(), Some("127.0.0.1"));
        assert_eq!(port, Some(9100));
    }

    #[test]
    fn parse_overrides_should_default_to_none_when_absent() {
        let (host, port) = parse_overrides(std::iter::empty());
        assert_eq!(host, None);
        assert_eq!(port, None);
    }

    #[test]
    fn parse_overrides_should_ignore_unparseable_port() {
        let args = vec!["--port".to_string(), "not-a-number".to_string()];
        let (_, port) = parse_overrides(args.into_iter());
        assert_eq!(port, None);
    }
}

#![forbid(unsafe_code)]

pub mod endpoint {
	use std::net::SocketAddr;

	/// Parsed `http://host:port` bind endpoint.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct HttpBindEndpoint {
		pub host: String,
		pub port: u16,
	}

	impl HttpBindEndpoint {
		/// Returns `host:port` (host preserved, IPv6 stays bracketed).
		pub fn hostport(&self) -> String {
			format!("{}:{}", self.host, self.port)
		}

		/// Binding needs an IP literal; DNS names are rejected here.
		pub fn to_socket_addr(&self) -> Result<SocketAddr, String> {
			self.hostport()
				.parse()
				.map_err(|_| format!("bind host must be an IP literal: {}", self.host))
		}

		/// Parse a bind endpoint in the form `http://host:port`.
		pub fn parse(s: &str) -> Result<Self, String> {
			let s = s.trim();
			if s.is_empty() {
				return Err("endpoint must be non-empty (expected http://host:port)".to_string());
			}

			let rest = s
				.strip_prefix("http://")
				.ok_or_else(|| format!("invalid endpoint (expected http://host:port): {s}"))?;

			if rest.contains('/') || rest.contains('?') || rest.contains('#') {
				return Err(format!("invalid endpoint (expected http://host:port without path/query): {s}"));
			}

			let (host, port_str) = rest
				.rsplit_once(':')
				.ok_or_else(|| format!("invalid endpoint (missing :port): {s}"))?;

			let host = host.trim();
			if host.is_empty() {
				return Err(format!("invalid endpoint host: {s}"));
			}

			if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
				return Err(format!("invalid endpoint host (IPv6 must be bracketed like http://[::1]:7071): {s}"));
			}

			let port: u16 = port_str
				.trim()
				.parse()
				.map_err(|_| format!("invalid endpoint port (expected 1..=65535): {s}"))?;

			if port == 0 {
				return Err(format!("invalid endpoint port (expected 1..=65535): {s}"));
			}

			Ok(Self {
				host: host.to_string(),
				port,
			})
		}
	}

}

pub mod backoff {
	use std::time::Duration;

	/// `base * 2^(attempt - 1)` for `attempt >= 1`, capped at `max`.
	pub fn exponential_delay(base: Duration, attempt: u32, max: Duration) -> Duration {
		let pow = attempt.saturating_sub(1).min(16);
		let ms = base.as_millis().saturating_mul(1u128 << pow);
		let d = Duration::from_millis(ms.min(u64::MAX as u128) as u64);
		d.min(max)
	}

}

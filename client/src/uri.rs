use crate::ClientError;

/// Port the STOMP transport listens on in a stock ActiveMQ/Artemis install.
pub const DEFAULT_STOMP_PORT: u16 = 61613;

const PLAIN_SCHEMES: &[&str] = &["tcp", "stomp", "nio", "stomp+nio"];
const TLS_SCHEMES: &[&str] = &["ssl", "tls", "stomp+ssl", "stomp+tls", "stomp+nio+ssl"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl BrokerEndpoint {
    /// Parse a broker uri such as `tcp://localhost:61613` or `stomp+ssl://broker:61614`.
    ///
    /// `failover:(a,b)` lists are reduced to their first member and query
    /// strings are ignored.
    pub fn parse(uri: &str) -> Result<Self, ClientError> {
        let invalid = |reason: &str| ClientError::InvalidUri {
            uri: uri.to_string(),
            reason: reason.to_string(),
        };

        let mut candidate = uri.trim();
        if let Some(rest) = candidate.strip_prefix("failover:") {
            candidate = rest.trim_start_matches('(');
            candidate = candidate
                .split([',', ')'])
                .next()
                .ok_or_else(|| invalid("empty failover list"))?
                .trim();
        }

        let url = url::Url::parse(candidate).map_err(|e| invalid(&e.to_string()))?;

        let scheme = url.scheme().to_ascii_lowercase();
        let tls = if TLS_SCHEMES.contains(&scheme.as_str()) {
            true
        } else if PLAIN_SCHEMES.contains(&scheme.as_str()) {
            false
        } else {
            return Err(invalid(&format!("unsupported scheme '{scheme}'")));
        };

        let host = url
            .host_str()
            .ok_or_else(|| invalid("no host found"))?
            .to_string();

        Ok(BrokerEndpoint {
            host,
            port: url.port().unwrap_or(DEFAULT_STOMP_PORT),
            tls,
        })
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Default port for both proxy paths when the peer names none.
pub const DEFAULT_PORT: u16 = 80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
}

impl ConnectTarget {
    /// The absolute URL recorded for a tunneled exchange.
    pub fn url(&self) -> String {
        format!("https://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectTargetError {
    EmptyAuthority,
    EmptyHost,
    InvalidAuthority,
    InvalidPort,
}

impl ConnectTargetError {
    pub fn code(self) -> &'static str {
        match self {
            Self::EmptyAuthority => "empty_authority",
            Self::EmptyHost => "empty_host",
            Self::InvalidAuthority => "invalid_authority",
            Self::InvalidPort => "invalid_port",
        }
    }
}

/// Parses a CONNECT request-target. The authority splits on the last colon;
/// a missing port falls back to [`DEFAULT_PORT`]. Bracketed IPv6 authorities
/// are accepted.
pub fn parse_connect_target(authority: &str) -> Result<ConnectTarget, ConnectTargetError> {
    if authority.is_empty() {
        return Err(ConnectTargetError::EmptyAuthority);
    }

    if authority.starts_with('[') {
        let bracket_close = authority
            .find(']')
            .ok_or(ConnectTargetError::InvalidAuthority)?;
        let host = &authority[1..bracket_close];
        if host.is_empty() {
            return Err(ConnectTargetError::EmptyHost);
        }

        let suffix = &authority[bracket_close + 1..];
        let port = match suffix.strip_prefix(':') {
            None if suffix.is_empty() => DEFAULT_PORT,
            None => return Err(ConnectTargetError::InvalidAuthority),
            Some("") => return Err(ConnectTargetError::InvalidPort),
            Some(port_text) => port_text
                .parse::<u16>()
                .map_err(|_| ConnectTargetError::InvalidPort)?,
        };
        return Ok(ConnectTarget {
            host: host.to_string(),
            port,
        });
    }

    match authority.rsplit_once(':') {
        None => Ok(ConnectTarget {
            host: authority.to_string(),
            port: DEFAULT_PORT,
        }),
        Some((host, port_text)) => {
            if host.is_empty() {
                return Err(ConnectTargetError::EmptyHost);
            }
            if host.contains(':') {
                return Err(ConnectTargetError::InvalidAuthority);
            }
            if port_text.is_empty() {
                return Err(ConnectTargetError::InvalidPort);
            }
            let port = port_text
                .parse::<u16>()
                .map_err(|_| ConnectTargetError::InvalidPort)?;
            Ok(ConnectTarget {
                host: host.to_string(),
                port,
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    pub host: String,
    pub port: u16,
    /// The validated absolute URL, kept for the exchange record.
    pub url: String,
    /// `path[?query]` written into the rewritten request line.
    pub origin_form: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardTargetError {
    NotAbsoluteUrl,
    UnsupportedScheme,
    EmptyHost,
    InvalidPort,
    MissingHostHeader,
    HostMismatch,
}

impl ForwardTargetError {
    pub fn code(self) -> &'static str {
        match self {
            Self::NotAbsoluteUrl => "not_absolute_url",
            Self::UnsupportedScheme => "unsupported_scheme",
            Self::EmptyHost => "empty_host",
            Self::InvalidPort => "invalid_port",
            Self::MissingHostHeader => "missing_host_header",
            Self::HostMismatch => "host_mismatch",
        }
    }
}

/// Validates a plain-proxy request-target: absolute `http://` URL whose host
/// agrees with the `Host` header, reduced to origin-form for forwarding.
pub fn parse_forward_target(
    target: &str,
    host_header: Option<&str>,
) -> Result<ForwardTarget, ForwardTargetError> {
    let (scheme, rest) = target
        .split_once("://")
        .ok_or(ForwardTargetError::NotAbsoluteUrl)?;
    if !scheme.eq_ignore_ascii_case("http") {
        return Err(ForwardTargetError::UnsupportedScheme);
    }

    let (authority, path_and_query) = match rest.find(['/', '?']) {
        Some(split) if rest.as_bytes()[split] == b'?' => {
            (&rest[..split], format!("/{}", &rest[split..]))
        }
        Some(split) => (&rest[..split], rest[split..].to_string()),
        None => (rest, "/".to_string()),
    };

    let (host, port) = split_authority(authority)?;
    if host.is_empty() {
        return Err(ForwardTargetError::EmptyHost);
    }

    let header = host_header.ok_or(ForwardTargetError::MissingHostHeader)?;
    if header.trim().is_empty() {
        return Err(ForwardTargetError::MissingHostHeader);
    }
    if !host.eq_ignore_ascii_case(host_header_host(header)) {
        return Err(ForwardTargetError::HostMismatch);
    }

    Ok(ForwardTarget {
        host: host.to_string(),
        port,
        url: target.to_string(),
        origin_form: path_and_query,
    })
}

fn split_authority(authority: &str) -> Result<(&str, u16), ForwardTargetError> {
    if let Some(bracket_close) = authority.strip_prefix('[').and_then(|_| authority.find(']')) {
        let host = &authority[1..bracket_close];
        let suffix = &authority[bracket_close + 1..];
        let port = match suffix.strip_prefix(':') {
            None if suffix.is_empty() => DEFAULT_PORT,
            None | Some("") => return Err(ForwardTargetError::InvalidPort),
            Some(port_text) => port_text
                .parse::<u16>()
                .map_err(|_| ForwardTargetError::InvalidPort)?,
        };
        return Ok((host, port));
    }

    match authority.rsplit_once(':') {
        None => Ok((authority, DEFAULT_PORT)),
        Some((host, port_text)) => {
            let port = port_text
                .parse::<u16>()
                .map_err(|_| ForwardTargetError::InvalidPort)?;
            Ok((host, port))
        }
    }
}

/// Strips an optional `:port` suffix from a Host header value so the
/// comparison sees hosts only.
fn host_header_host(value: &str) -> &str {
    let value = value.trim();
    if let Some(bracket_close) = value.strip_prefix('[').and_then(|_| value.find(']')) {
        return &value[1..bracket_close];
    }
    match value.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !host.contains(':') => {
            host
        }
        _ => value,
    }
}

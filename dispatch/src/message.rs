//! Minimal message vocabulary the dispatch core is specified against.
//!
//! The full SIP grammar (parsing, header catalog, body handling) is an
//! external collaborator of this core; only the slice of it the dispatcher
//! actually reads or writes is modelled here, following the naming of the
//! upstream message layer (`SipMethod`, `TransportProtocol`, `StatusCode`)
//! without pulling in its parser.

use std::fmt;
use std::str::FromStr;

use util::ArcStr;

/// SIP request methods relevant to retransmit timing and routing.
///
/// Unknown/extension methods are preserved verbatim rather than rejected,
/// matching how the upstream message layer treats the method token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Invite,
    Ack,
    Bye,
    Cancel,
    Register,
    Options,
    Extension(ArcStr),
}

impl SipMethod {
    /// True for the method that never gets retransmitted as a request.
    pub fn is_ack(&self) -> bool {
        matches!(self, SipMethod::Ack)
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SipMethod::Invite => write!(f, "INVITE"),
            SipMethod::Ack => write!(f, "ACK"),
            SipMethod::Bye => write!(f, "BYE"),
            SipMethod::Cancel => write!(f, "CANCEL"),
            SipMethod::Register => write!(f, "REGISTER"),
            SipMethod::Options => write!(f, "OPTIONS"),
            SipMethod::Extension(s) => write!(f, "{s}"),
        }
    }
}

impl FromStr for SipMethod {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "INVITE" => SipMethod::Invite,
            "ACK" => SipMethod::Ack,
            "BYE" => SipMethod::Bye,
            "CANCEL" => SipMethod::Cancel,
            "REGISTER" => SipMethod::Register,
            "OPTIONS" => SipMethod::Options,
            other => SipMethod::Extension(ArcStr::from(other)),
        })
    }
}

/// A SIP response status code, split into the class that matters for
/// retransmit timing (provisional vs. final) and the raw numeric code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct StatusCode(pub u16);

impl StatusCode {
    /// `code > 100` per the timing rules; 100 Trying is provisional and
    /// never carries a retransmit schedule of its own.
    pub fn is_final(self) -> bool {
        self.0 > 100
    }
}

/// Transport protocol a leg speaks, or a candidate is reachable over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Udp,
    Tcp,
}

impl TransportProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportProtocol::Udp => "udp",
            TransportProtocol::Tcp => "tcp",
        }
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TransportProtocol {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(TransportProtocol::Udp),
            "tcp" => Ok(TransportProtocol::Tcp),
            other => Err(crate::error::Error::Invalid(format!(
                "unknown transport {other}"
            ))),
        }
    }
}

/// URI scheme, which fixes the default protocol preference (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UriScheme {
    Sip,
    Sips,
}

/// A parsed `sip:`/`sips:` URI, reduced to the fields the resolver needs.
#[derive(Debug, Clone)]
pub struct SipUri {
    pub scheme: UriScheme,
    pub user: Option<ArcStr>,
    pub domain: Option<ArcStr>,
    pub port: Option<u16>,
    pub transport_param: Option<ArcStr>,
}

impl SipUri {
    /// Parses `sip:user@host[:port][;transport=x]` / `sips:...`.
    ///
    /// This is intentionally forgiving: it extracts only what the resolver
    /// consumes and ignores any other URI parameters or headers. A full SIP
    /// URI grammar belongs to the external URI helper (§1).
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        let raw = raw.trim();
        let (scheme, rest) = if let Some(rest) = raw.strip_prefix("sips:") {
            (UriScheme::Sips, rest)
        } else if let Some(rest) = raw.strip_prefix("sip:") {
            (UriScheme::Sip, rest)
        } else {
            return Err(crate::error::Error::Invalid(format!(
                "not a sip(s) uri: {raw}"
            )));
        };

        // Split off ;params (and anything after a header '?') before
        // looking for user@host.
        let core = rest.split(['?']).next().unwrap_or(rest);
        let mut parts = core.split(';');
        let userhost = parts.next().unwrap_or("");
        let mut transport_param = None;
        for param in parts {
            if let Some(v) = param.strip_prefix("transport=") {
                transport_param = Some(ArcStr::from(v));
            }
        }

        let (user, hostport) = match userhost.rsplit_once('@') {
            Some((u, h)) => (Some(ArcStr::from(u)), h),
            None => (None, userhost),
        };

        if hostport.is_empty() {
            return Ok(SipUri {
                scheme,
                user,
                domain: None,
                port: None,
                transport_param,
            });
        }

        let (host, port) = split_host_port(hostport);

        Ok(SipUri {
            scheme,
            user,
            domain: Some(ArcStr::from(host)),
            port,
            transport_param,
        })
    }
}

/// Splits `host[:port]`, tolerating bracketed IPv6 literals (`[::1]:5060`).
fn split_host_port(s: &str) -> (&str, Option<u16>) {
    if let Some(rest) = s.strip_prefix('[') {
        if let Some((addr, tail)) = rest.split_once(']') {
            let port = tail.strip_prefix(':').and_then(|p| p.parse().ok());
            return (addr, port);
        }
    }
    match s.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
            (host, port.parse().ok())
        }
        _ => (s, None),
    }
}

/// The slice of a SIP message the dispatch core reads or writes.
///
/// This stands in for the external packet/parser collaborator (§1, §3):
/// only the accessors the dispatcher and proxy forwarder actually call are
/// specified. A real implementation backs this with the full parsed message.
pub trait Packet: fmt::Debug + Send + Sync {
    /// True for requests.
    fn is_request(&self) -> bool;
    /// True for responses.
    fn is_response(&self) -> bool {
        !self.is_request()
    }
    /// Request method; meaningless (but must still return something) on a
    /// response, callers are expected to gate on `is_request` first.
    fn method(&self) -> SipMethod;
    /// Response status code; only meaningful when `is_response`.
    fn code(&self) -> Option<StatusCode>;
    /// `CSeq` numeric value.
    fn cseq(&self) -> u32;
    /// `CSeq` method (requests: equal to `method()`; responses: the method
    /// the request that provoked this response carried).
    fn cseq_method(&self) -> SipMethod;
    /// `Call-ID` header value.
    fn call_id(&self) -> ArcStr;
    /// Request-URI (requests only), raw and unparsed; callers that need
    /// its structure go through [`SipUri::parse`].
    fn uri(&self) -> Option<ArcStr>;
    /// Transaction id: branch + CSeq fingerprint, used for cancellation and
    /// correlation.
    fn tid(&self) -> ArcStr;
    /// Topmost `Via` header, raw.
    fn top_via(&self) -> Option<ArcStr>;
    /// Topmost `Route` header URI, raw, if any.
    fn top_route(&self) -> Option<ArcStr>;
    /// Removes and returns the topmost `Route` header.
    fn pop_route(&mut self);
    /// All `Contact` header values, raw.
    fn contacts(&self) -> Vec<ArcStr>;
    /// Replaces all `Contact` header values.
    fn set_contacts(&mut self, contacts: Vec<ArcStr>);
    /// Serialises the packet to wire bytes.
    fn dump(&self) -> Vec<u8>;
}

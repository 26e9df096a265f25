//! Autodiscover POX request and response documents.
//!
//! The request is a small fixed XML payload; the response is parsed with
//! `quick-xml` serde derives into [`AutodiscoverResponse`]. A response is
//! one of: settings, a redirect to another email address, a redirect to
//! another URL, or an error envelope.

use serde::Deserialize;
use thiserror::Error;

use crate::error::AutodiscoverError;

pub const REQUEST_NS: &str =
    "http://schemas.microsoft.com/exchange/autodiscover/outlook/requestschema/2006";
pub const RESPONSE_NS: &str =
    "http://schemas.microsoft.com/exchange/autodiscover/outlook/responseschema/2006a";
pub const ERROR_NS: &str = "http://schemas.microsoft.com/exchange/autodiscover/responseschema/2006";

const UTF8_BOM: &[u8] = b"\xef\xbb\xbf";

/// Messages Exchange uses for a well-formed "no such mailbox" error.
const MAILBOX_NOT_FOUND_MESSAGES: [&str; 2] = [
    "The e-mail address cannot be found.",
    "The email address can't be found.",
];

/// Build the Autodiscover request payload for `email`.
pub fn payload(email: &str) -> Vec<u8> {
    let email = quick_xml::escape::escape(email);
    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\
         <Autodiscover xmlns=\"{REQUEST_NS}\">\
         <Request>\
         <EMailAddress>{email}</EMailAddress>\
         <AcceptableResponseSchema>{RESPONSE_NS}</AcceptableResponseSchema>\
         </Request>\
         </Autodiscover>"
    )
    .into_bytes()
}

#[derive(Debug, Error)]
pub enum ParseError {
    /// Not an XML document at all. A common symptom of a greedy web server
    /// serving custom HTML error pages as 200 OK.
    #[error("Response is not XML")]
    NotXml,

    #[error("Error parsing XML: {0}")]
    Xml(String),

    #[error("Unexpected Autodiscover document: {0}")]
    Invalid(String),

    #[error("No valid protocols in response")]
    NoProtocol,

    #[error("Required element 'EwsUrl' not found in response")]
    MissingEwsUrl,
}

/// Protocol entry types we can use for EWS. EXPR designates the external
/// endpoint and is preferred; EXCH is the internal fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolType {
    Expr,
    Exch,
}

/// Resolved connection settings from a `settings` action response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub ews_url: String,
    pub primary_smtp_address: Option<String>,
    pub server_version: Option<String>,
    pub protocol_type: ProtocolType,
    pub auth_package: Option<String>,
}

/// A parsed Autodiscover response document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutodiscoverResponse {
    Settings(Settings),
    RedirectAddress { email: String },
    RedirectUrl { url: String },
    Error { code: String, message: String },
}

impl AutodiscoverResponse {
    pub fn is_redirect_url(&self) -> bool {
        matches!(self, Self::RedirectUrl { .. })
    }
}

/// Map an error envelope to the caller-facing taxonomy: "mailbox not
/// found" confirms we reached the right server and gets its own kind.
pub(crate) fn error_from_envelope(code: &str, message: &str) -> AutodiscoverError {
    if MAILBOX_NOT_FOUND_MESSAGES.contains(&message) {
        AutodiscoverError::NonExistentMailbox
    } else {
        AutodiscoverError::ServerError {
            code: code.to_string(),
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AutodiscoverXml {
    #[serde(rename = "Response")]
    response: Option<ResponseXml>,
}

#[derive(Debug, Deserialize)]
struct ResponseXml {
    #[serde(rename = "User")]
    user: Option<UserXml>,
    #[serde(rename = "Account")]
    account: Option<AccountXml>,
    #[serde(rename = "Error")]
    error: Option<ErrorXml>,
}

#[derive(Debug, Deserialize)]
struct UserXml {
    #[serde(rename = "AutoDiscoverSMTPAddress")]
    autodiscover_smtp_address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AccountXml {
    #[serde(rename = "Action")]
    action: Option<String>,
    #[serde(rename = "RedirectAddr")]
    redirect_addr: Option<String>,
    #[serde(rename = "RedirectURL")]
    redirect_url: Option<String>,
    #[serde(rename = "Protocol", default)]
    protocols: Vec<ProtocolXml>,
}

#[derive(Debug, Deserialize)]
struct ProtocolXml {
    #[serde(rename = "Type")]
    protocol_type: Option<String>,
    #[serde(rename = "EwsUrl")]
    ews_url: Option<String>,
    #[serde(rename = "ServerVersion")]
    server_version: Option<String>,
    #[serde(rename = "AuthPackage")]
    auth_package: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorXml {
    #[serde(rename = "ErrorCode")]
    code: Option<String>,
    #[serde(rename = "Message")]
    message: Option<String>,
}

/// Parse an Autodiscover response body.
pub fn parse(bytes: &[u8]) -> Result<AutodiscoverResponse, ParseError> {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    // Lightweight XML test first. Greedy web servers commonly answer the
    // autodiscover URL with an HTML page and status 200.
    if !bytes.starts_with(b"<?xml") && !bytes.starts_with(b"<Autodiscover") {
        return Err(ParseError::NotXml);
    }
    let text = std::str::from_utf8(bytes).map_err(|_| ParseError::NotXml)?;
    let document: AutodiscoverXml =
        quick_xml::de::from_str(text).map_err(|e| ParseError::Xml(e.to_string()))?;

    let response = document
        .response
        .ok_or_else(|| ParseError::Invalid("missing Response element".into()))?;

    if let Some(error) = response.error {
        return Ok(AutodiscoverResponse::Error {
            code: error.code.unwrap_or_default(),
            message: error.message.unwrap_or_default(),
        });
    }

    let account = response
        .account
        .ok_or_else(|| ParseError::Invalid("missing Account element".into()))?;

    match account.action.as_deref() {
        Some("redirectAddr") => {
            let email = account
                .redirect_addr
                .ok_or_else(|| ParseError::Invalid("redirectAddr without RedirectAddr".into()))?;
            Ok(AutodiscoverResponse::RedirectAddress { email })
        }
        Some("redirectUrl") => {
            let url = account
                .redirect_url
                .ok_or_else(|| ParseError::Invalid("redirectUrl without RedirectURL".into()))?;
            Ok(AutodiscoverResponse::RedirectUrl { url })
        }
        Some("settings") => {
            let primary_smtp_address = response
                .user
                .and_then(|user| user.autodiscover_smtp_address);
            settings_from_account(&account, primary_smtp_address)
                .map(AutodiscoverResponse::Settings)
        }
        other => Err(ParseError::Invalid(format!(
            "unknown account action {other:?}"
        ))),
    }
}

/// Pick the protocol entry to use: EXPR is preferred, EXCH is the
/// fallback for installations without an external endpoint.
fn settings_from_account(
    account: &AccountXml,
    primary_smtp_address: Option<String>,
) -> Result<Settings, ParseError> {
    let entry_of = |wanted: &str| {
        account
            .protocols
            .iter()
            .find(|p| p.protocol_type.as_deref() == Some(wanted))
    };
    let (entry, protocol_type) = entry_of("EXPR")
        .map(|p| (p, ProtocolType::Expr))
        .or_else(|| entry_of("EXCH").map(|p| (p, ProtocolType::Exch)))
        .ok_or(ParseError::NoProtocol)?;

    let ews_url = entry
        .ews_url
        .clone()
        .filter(|url| !url.is_empty())
        .ok_or(ParseError::MissingEwsUrl)?;

    // Not all protocol entries carry a server version; also look at the
    // other entries pointing at the same endpoint.
    let server_version = account
        .protocols
        .iter()
        .filter(|p| {
            p.ews_url
                .as_deref()
                .is_some_and(|url| url.eq_ignore_ascii_case(&ews_url))
        })
        .find_map(|p| p.server_version.clone());

    Ok(Settings {
        ews_url,
        primary_smtp_address,
        server_version,
        protocol_type,
        auth_package: entry.auth_package.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_xml(protocols: &str, user: &str) -> Vec<u8> {
        format!(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?>\
             <Autodiscover xmlns=\"{ERROR_NS}\">\
             <Response xmlns=\"{RESPONSE_NS}\">\
             <User>{user}</User>\
             <Account><AccountType>email</AccountType><Action>settings</Action>{protocols}</Account>\
             </Response></Autodiscover>"
        )
        .into_bytes()
    }

    #[test]
    fn test_payload_shape() {
        let body = String::from_utf8(payload("user@example.com")).unwrap();
        assert!(body.starts_with("<?xml version=\"1.0\" encoding=\"utf-8\"?>"));
        assert!(body.contains("<EMailAddress>user@example.com</EMailAddress>"));
        assert!(body.contains(&format!(
            "<AcceptableResponseSchema>{RESPONSE_NS}</AcceptableResponseSchema>"
        )));
        assert!(body.contains(&format!("<Autodiscover xmlns=\"{REQUEST_NS}\">")));
    }

    #[test]
    fn test_payload_escapes_email() {
        let body = String::from_utf8(payload("a&b@example.com")).unwrap();
        assert!(body.contains("a&amp;b@example.com"));
    }

    #[test]
    fn test_parse_settings() {
        let xml = settings_xml(
            "<Protocol><Type>EXPR</Type>\
             <EwsUrl>https://mail.example.com/EWS/Exchange.asmx</EwsUrl>\
             <ServerVersion>15.01.2507.016</ServerVersion>\
             <AuthPackage>basic</AuthPackage></Protocol>",
            "<AutoDiscoverSMTPAddress>user@example.com</AutoDiscoverSMTPAddress>",
        );
        let parsed = parse(&xml).unwrap();
        let AutodiscoverResponse::Settings(settings) = parsed else {
            panic!("expected settings, got {parsed:?}");
        };
        assert_eq!(settings.ews_url, "https://mail.example.com/EWS/Exchange.asmx");
        assert_eq!(
            settings.primary_smtp_address.as_deref(),
            Some("user@example.com")
        );
        assert_eq!(settings.server_version.as_deref(), Some("15.01.2507.016"));
        assert_eq!(settings.protocol_type, ProtocolType::Expr);
    }

    #[test]
    fn test_expr_preferred_over_exch() {
        let xml = settings_xml(
            "<Protocol><Type>EXCH</Type>\
             <EwsUrl>https://internal.example.com/EWS/Exchange.asmx</EwsUrl></Protocol>\
             <Protocol><Type>EXPR</Type>\
             <EwsUrl>https://mail.example.com/EWS/Exchange.asmx</EwsUrl></Protocol>",
            "",
        );
        let parsed = parse(&xml).unwrap();
        let AutodiscoverResponse::Settings(settings) = parsed else {
            panic!("expected settings");
        };
        assert_eq!(settings.ews_url, "https://mail.example.com/EWS/Exchange.asmx");
        assert_eq!(settings.protocol_type, ProtocolType::Expr);
    }

    #[test]
    fn test_version_borrowed_from_matching_entry() {
        // The EXPR entry has no version, but an EXCH entry pointing at the
        // same endpoint does.
        let xml = settings_xml(
            "<Protocol><Type>EXPR</Type>\
             <EwsUrl>https://mail.example.com/EWS/Exchange.asmx</EwsUrl></Protocol>\
             <Protocol><Type>EXCH</Type>\
             <EwsUrl>HTTPS://MAIL.EXAMPLE.COM/EWS/Exchange.asmx</EwsUrl>\
             <ServerVersion>15.00.0847.032</ServerVersion></Protocol>",
            "",
        );
        let AutodiscoverResponse::Settings(settings) = parse(&xml).unwrap() else {
            panic!("expected settings");
        };
        assert_eq!(settings.server_version.as_deref(), Some("15.00.0847.032"));
    }

    #[test]
    fn test_no_usable_protocol() {
        let xml = settings_xml(
            "<Protocol><Type>WEB</Type><EwsUrl>https://x/</EwsUrl></Protocol>",
            "",
        );
        assert!(matches!(parse(&xml), Err(ParseError::NoProtocol)));
    }

    #[test]
    fn test_missing_ews_url() {
        let xml = settings_xml("<Protocol><Type>EXPR</Type></Protocol>", "");
        assert!(matches!(parse(&xml), Err(ParseError::MissingEwsUrl)));
    }

    #[test]
    fn test_parse_redirect_address() {
        let xml = format!(
            "<?xml version=\"1.0\"?><Autodiscover xmlns=\"{ERROR_NS}\">\
             <Response xmlns=\"{RESPONSE_NS}\">\
             <Account><Action>redirectAddr</Action>\
             <RedirectAddr>user@other.example.com</RedirectAddr></Account>\
             </Response></Autodiscover>"
        );
        assert_eq!(
            parse(xml.as_bytes()).unwrap(),
            AutodiscoverResponse::RedirectAddress {
                email: "user@other.example.com".into()
            }
        );
    }

    #[test]
    fn test_parse_redirect_url() {
        let xml = format!(
            "<?xml version=\"1.0\"?><Autodiscover xmlns=\"{ERROR_NS}\">\
             <Response xmlns=\"{RESPONSE_NS}\">\
             <Account><Action>redirectUrl</Action>\
             <RedirectURL>https://autodiscover.other.example.com/Autodiscover/Autodiscover.xml</RedirectURL>\
             </Account></Response></Autodiscover>"
        );
        let parsed = parse(xml.as_bytes()).unwrap();
        assert!(parsed.is_redirect_url());
    }

    #[test]
    fn test_parse_error_envelope() {
        let xml = format!(
            "<?xml version=\"1.0\"?><Autodiscover xmlns=\"{ERROR_NS}\">\
             <Response><Error Time=\"16:20:31.0649307\" Id=\"2107907648\">\
             <ErrorCode>500</ErrorCode>\
             <Message>The e-mail address cannot be found.</Message>\
             <DebugData/></Error></Response></Autodiscover>"
        );
        let AutodiscoverResponse::Error { code, message } = parse(xml.as_bytes()).unwrap() else {
            panic!("expected error envelope");
        };
        assert_eq!(code, "500");
        assert!(matches!(
            error_from_envelope(&code, &message),
            AutodiscoverError::NonExistentMailbox
        ));
    }

    #[test]
    fn test_unknown_error_envelope() {
        assert!(matches!(
            error_from_envelope("600", "Invalid Request"),
            AutodiscoverError::ServerError { .. }
        ));
        // Both known phrasings of the mailbox error map to the same kind.
        assert!(matches!(
            error_from_envelope("500", "The email address can't be found."),
            AutodiscoverError::NonExistentMailbox
        ));
    }

    #[test]
    fn test_html_is_not_xml() {
        let err = parse(b"<html><body>It works!</body></html>").unwrap_err();
        assert!(matches!(err, ParseError::NotXml));
    }

    #[test]
    fn test_bom_is_tolerated() {
        let mut xml = b"\xef\xbb\xbf".to_vec();
        xml.extend_from_slice(&settings_xml(
            "<Protocol><Type>EXPR</Type><EwsUrl>https://mail.example.com/EWS/Exchange.asmx</EwsUrl></Protocol>",
            "",
        ));
        assert!(parse(&xml).is_ok());
    }
}

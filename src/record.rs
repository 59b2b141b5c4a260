//! The signed summary record shipped to collectors.
//!
//! A record is eleven newline separated fields followed by a newline and the
//! lowercase hex MD5 of those bytes concatenated with the trimmed feed key.
//! Collectors rely on this exact layout; the field order and the digest algorithm
//! are part of the wire format and must not change without updating them.

use md5::{Digest, Md5};

use crate::attributes::Attributes;

/// Placeholder Postfix uses when the reverse lookup of the client failed
const UNKNOWN: &str = "unknown";

/// Number of text fields before the digest line
pub const FIELD_COUNT: usize = 11;

/// Identity and shared secret of the feed a record belongs to.
#[derive(Clone)]
pub struct Feed {
    name: String,
    key: String,
}

impl std::fmt::Debug for Feed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Feed")
            .field("name", &self.name)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl Feed {
    /// The key is trimmed once here, so that stray whitespace in the configuration
    /// does not end up in the digest.
    #[must_use]
    pub fn new(name: impl Into<String>, key: &str) -> Self {
        Self {
            name: name.into(),
            key: key.trim().to_string(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Build and sign the record for one transaction.
    #[must_use]
    pub fn encode(&self, attributes: &Attributes, epoch: u64) -> WireRecord {
        WireRecord::from_attributes(&self.name, attributes, epoch).sign(&self.key)
    }

    /// Check that `payload` carries a valid digest for this feed.
    #[must_use]
    pub fn verify(&self, payload: &[u8]) -> bool {
        let Some(split) = payload.iter().rposition(|&b| b == b'\n') else {
            return false;
        };
        let (body, digest) = payload.split_at(split + 1);

        digest == digest_hex(body, &self.key).as_bytes()
    }
}

/// The decoded fields of one record, in wire order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fields {
    pub feed_name: String,
    pub epoch: String,
    pub server_port: String,
    pub client_address: String,
    pub client_name: String,
    pub helo_name: String,
    pub esmtp: String,
    pub encrypted: String,
    pub authenticated: String,
    pub sender_domain: String,
    /// Reserved for structured data, always empty for now
    pub extension: String,
}

impl Fields {
    fn as_array(&self) -> [&str; FIELD_COUNT] {
        [
            self.feed_name.as_str(),
            self.epoch.as_str(),
            self.server_port.as_str(),
            self.client_address.as_str(),
            self.client_name.as_str(),
            self.helo_name.as_str(),
            self.esmtp.as_str(),
            self.encrypted.as_str(),
            self.authenticated.as_str(),
            self.sender_domain.as_str(),
            self.extension.as_str(),
        ]
    }
}

/// `Y` / `N` when the attribute is present, empty when it is not
fn flag(attribute: Option<&str>, test: impl FnOnce(&str) -> bool) -> String {
    attribute
        .map(|value| if test(value) { "Y" } else { "N" })
        .unwrap_or_default()
        .to_string()
}

fn client_name(attributes: &Attributes) -> &str {
    let plain = attributes.get("client_name").unwrap_or_default();

    match attributes.get("client_reverse_name") {
        Some(reverse) if reverse != UNKNOWN => reverse,
        _ => plain,
    }
}

fn sender_domain(sender: &str) -> &str {
    sender.split_once('@').map_or(sender, |(_, domain)| domain)
}

fn digest_hex(body: &[u8], key: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(body);
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// A record, either still unsigned or carrying its digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireRecord {
    fields: Fields,
    digest: Option<String>,
}

impl WireRecord {
    #[must_use]
    pub fn from_attributes(feed_name: &str, attributes: &Attributes, epoch: u64) -> Self {
        let get = |key: &str| attributes.get(key).unwrap_or_default().to_string();

        let fields = Fields {
            feed_name: feed_name.to_string(),
            epoch: epoch.to_string(),
            server_port: get("server_port"),
            client_address: get("client_address"),
            client_name: client_name(attributes).to_string(),
            helo_name: get("helo_name"),
            esmtp: flag(attributes.get("protocol_name"), |p| p == "ESMTP"),
            encrypted: flag(attributes.get("encryption_keysize"), |size| {
                size.trim().parse::<f64>().is_ok_and(|size| size > 0.0)
            }),
            authenticated: flag(attributes.get("sasl_method"), |method| !method.is_empty()),
            sender_domain: sender_domain(attributes.get("sender").unwrap_or_default())
                .to_string(),
            extension: String::new(),
        };

        Self {
            fields,
            digest: None,
        }
    }

    #[must_use]
    pub const fn fields(&self) -> &Fields {
        &self.fields
    }

    #[must_use]
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// The newline joined fields, with the trailing newline the digest covers
    #[must_use]
    pub fn body(&self) -> String {
        let mut body = self.fields.as_array().join("\n");
        body.push('\n');
        body
    }

    #[must_use]
    pub fn sign(mut self, key: &str) -> Self {
        self.digest = Some(digest_hex(self.body().as_bytes(), key.trim()));
        self
    }

    /// The datagram sent to collectors. An unsigned record has an empty digest line.
    #[must_use]
    pub fn to_payload(&self) -> Vec<u8> {
        let mut payload = self.body();
        payload.push_str(self.digest().unwrap_or_default());
        payload.into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const EPOCH: u64 = 1_700_000_000_123;

    fn attributes(pairs: &[(&str, &str)]) -> Attributes {
        pairs.iter().copied().collect()
    }

    fn full() -> Attributes {
        attributes(&[
            ("request", "smtpd_access_policy"),
            ("protocol_state", "RCPT"),
            ("protocol_name", "ESMTP"),
            ("client_address", "192.0.2.10"),
            ("client_name", "mail.example.org"),
            ("client_reverse_name", "rev.example.org"),
            ("helo_name", "helo.example.org"),
            ("sender", "alice@example.org"),
            ("instance", "2d8f.6571e3c1.8a1b5.0"),
            ("encryption_keysize", "256"),
            ("sasl_method", "PLAIN"),
            ("server_port", "25"),
        ])
    }

    #[test]
    fn fields_follow_attributes() {
        let record = WireRecord::from_attributes("feed", &full(), EPOCH);

        assert_eq!(
            *record.fields(),
            Fields {
                feed_name: "feed".to_string(),
                epoch: "1700000000123".to_string(),
                server_port: "25".to_string(),
                client_address: "192.0.2.10".to_string(),
                client_name: "rev.example.org".to_string(),
                helo_name: "helo.example.org".to_string(),
                esmtp: "Y".to_string(),
                encrypted: "Y".to_string(),
                authenticated: "Y".to_string(),
                sender_domain: "example.org".to_string(),
                extension: String::new(),
            }
        );
    }

    #[test]
    fn unknown_reverse_name_falls_back_to_client_name() {
        let record = WireRecord::from_attributes(
            "feed",
            &attributes(&[
                ("client_reverse_name", "unknown"),
                ("client_name", "host.example.com"),
            ]),
            EPOCH,
        );
        assert_eq!(record.fields().client_name, "host.example.com");

        let record = WireRecord::from_attributes(
            "feed",
            &attributes(&[("client_name", "host.example.com")]),
            EPOCH,
        );
        assert_eq!(record.fields().client_name, "host.example.com");
    }

    #[test]
    fn flags_distinguish_absent_from_negative() {
        let absent = WireRecord::from_attributes("feed", &Attributes::new(), EPOCH);
        assert_eq!(absent.fields().esmtp, "");
        assert_eq!(absent.fields().encrypted, "");
        assert_eq!(absent.fields().authenticated, "");

        let negative = WireRecord::from_attributes(
            "feed",
            &attributes(&[
                ("protocol_name", "SMTP"),
                ("encryption_keysize", "0"),
                ("sasl_method", ""),
            ]),
            EPOCH,
        );
        assert_eq!(negative.fields().esmtp, "N");
        assert_eq!(negative.fields().encrypted, "N");
        assert_eq!(negative.fields().authenticated, "N");

        let garbage = WireRecord::from_attributes(
            "feed",
            &attributes(&[("encryption_keysize", "lots")]),
            EPOCH,
        );
        assert_eq!(garbage.fields().encrypted, "N");
    }

    #[test]
    fn sender_domain_after_first_at() {
        assert_eq!(sender_domain("user@example.com"), "example.com");
        assert_eq!(sender_domain("odd@user@example.com"), "user@example.com");
        assert_eq!(sender_domain("postmaster"), "postmaster");
        assert_eq!(sender_domain(""), "");
    }

    #[test]
    fn payload_layout() {
        let feed = Feed::new("feed", "secret");
        let payload = String::from_utf8(feed.encode(&full(), EPOCH).to_payload()).unwrap();

        let lines = payload.split('\n').collect::<Vec<_>>();
        assert_eq!(lines.len(), FIELD_COUNT + 1);
        assert_eq!(lines[0], "feed");
        assert_eq!(lines[10], "");
        assert_eq!(lines[11].len(), 32);
        assert!(lines[11].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert!(!payload.ends_with('\n'));
    }

    #[test]
    fn digest_matches_independent_computation() {
        let feed = Feed::new("feed", "  secret\n");
        let record = feed.encode(&full(), EPOCH);

        let expected = format!("{:x}", Md5::digest(format!("{}secret", record.body())));
        assert_eq!(record.digest(), Some(expected.as_str()));
    }

    #[test]
    fn known_digest() {
        // md5("\n\n\n\n\n\n\n\n\n\n\n") with an empty key
        let record = WireRecord {
            fields: Fields::default(),
            digest: None,
        }
        .sign("");

        let expected = format!("{:x}", Md5::digest("\n".repeat(FIELD_COUNT)));
        assert_eq!(record.digest(), Some(expected.as_str()));
    }

    #[test]
    fn encoding_is_deterministic() {
        let feed = Feed::new("feed", "secret");
        assert_eq!(
            feed.encode(&full(), EPOCH).to_payload(),
            feed.encode(&full(), EPOCH).to_payload()
        );
    }

    #[test]
    fn verify_round_trip() {
        let feed = Feed::new("feed", "secret");
        let mut payload = feed.encode(&full(), EPOCH).to_payload();
        assert!(feed.verify(&payload));
        assert!(!Feed::new("feed", "other").verify(&payload));

        payload[0] = b'g';
        assert!(!feed.verify(&payload));
        assert!(!feed.verify(b"no newline"));
    }

    #[test]
    fn debug_hides_key() {
        let feed = Feed::new("feed", "secret");
        assert!(!format!("{feed:?}").contains("secret"));
    }
}

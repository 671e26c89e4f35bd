//! SCRAM-SHA-256 client (RFC 5802, RFC 7677).
//!
//! Pure message construction; the connection drives the exchange.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

type HmacSha256 = Hmac<Sha256>;

/// Length of the raw client nonce before base64 encoding.
const NONCE_LEN: usize = 18;

/// SCRAM failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScramError {
    #[error("malformed SCRAM message")]
    Malformed,

    #[error("server nonce does not extend the client nonce")]
    NonceMismatch,

    #[error("server signature verification failed")]
    SignatureMismatch,

    #[error("SCRAM exchange used out of order")]
    InvalidState,

    #[error("cannot XOR byte strings of different lengths ({0} and {1})")]
    LengthMismatch(usize, usize),

    #[error("invalid HMAC key")]
    InvalidKey,
}

impl ScramError {
    /// Errors that point at a bug in this module rather than at the server.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            ScramError::LengthMismatch(..) | ScramError::InvalidState | ScramError::InvalidKey
        )
    }
}

/// State carried from the server-first message to verification.
struct Verifier {
    salted_password: Vec<u8>,
    auth_message: String,
}

/// SCRAM-SHA-256 client state machine.
pub struct ScramClient {
    password: String,
    client_first_bare: String,
    client_nonce: String,
    verifier: Option<Verifier>,
}

impl ScramClient {
    /// Create a client with a fresh random nonce.
    pub fn new(username: &str, password: &str) -> Self {
        let nonce_bytes: [u8; NONCE_LEN] = rand::thread_rng().gen();
        Self::with_nonce(username, password, &BASE64.encode(nonce_bytes))
    }

    /// Create a client with a caller-supplied (already encoded) nonce.
    pub fn with_nonce(username: &str, password: &str, client_nonce: &str) -> Self {
        let user: String = username.nfkc().collect();
        Self {
            password: password.nfkc().collect(),
            client_first_bare: format!("n={},r={}", user, client_nonce),
            client_nonce: client_nonce.to_string(),
            verifier: None,
        }
    }

    /// `n,,n=<user>,r=<nonce>`
    pub fn client_first_message(&self) -> String {
        format!("n,,{}", self.client_first_bare)
    }

    /// Consume `r=<nonce>,s=<salt>,i=<iterations>` and produce the
    /// client-final message carrying the proof.
    pub fn process_server_first(&mut self, server_first: &str) -> Result<String, ScramError> {
        let (server_nonce, salt, iterations) = parse_server_first(server_first)?;
        if !server_nonce.starts_with(&self.client_nonce) {
            return Err(ScramError::NonceMismatch);
        }

        let salted_password = hi(self.password.as_bytes(), &salt, iterations)?;
        let client_key = hmac_sha256(&salted_password, b"Client Key")?;
        let stored_key = sha256(&client_key);

        let client_final_without_proof = format!("c=biws,r={}", server_nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, server_first, client_final_without_proof
        );

        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes())?;
        let client_proof = xor_bytes(&client_key, &client_signature)?;

        self.verifier = Some(Verifier {
            salted_password,
            auth_message,
        });

        Ok(format!(
            "{},p={}",
            client_final_without_proof,
            BASE64.encode(client_proof)
        ))
    }

    /// Check `v=<signature>` against the locally derived server signature.
    pub fn verify_server_final(&self, server_final: &str) -> Result<(), ScramError> {
        let verifier = self.verifier.as_ref().ok_or(ScramError::InvalidState)?;
        let signature = server_final
            .strip_prefix("v=")
            .ok_or(ScramError::Malformed)?;
        let signature = BASE64.decode(signature).map_err(|_| ScramError::Malformed)?;

        if signature != server_signature(verifier)? {
            return Err(ScramError::SignatureMismatch);
        }
        Ok(())
    }
}

fn server_signature(verifier: &Verifier) -> Result<Vec<u8>, ScramError> {
    let server_key = hmac_sha256(&verifier.salted_password, b"Server Key")?;
    hmac_sha256(&server_key, verifier.auth_message.as_bytes())
}

/// Split the server-first message; attributes must come as `r`, `s`, `i`.
fn parse_server_first(msg: &str) -> Result<(&str, Vec<u8>, u32), ScramError> {
    let mut parts = msg.split(',');
    let mut attr = |prefix: &str| {
        parts
            .next()
            .and_then(|p| p.strip_prefix(prefix))
            .ok_or(ScramError::Malformed)
    };

    let nonce = attr("r=")?;
    let salt = attr("s=")?;
    let iterations = attr("i=")?;

    if nonce.is_empty() {
        return Err(ScramError::Malformed);
    }
    let salt = BASE64.decode(salt).map_err(|_| ScramError::Malformed)?;
    if iterations.is_empty() || !iterations.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ScramError::Malformed);
    }
    let iterations: u32 = iterations.parse().map_err(|_| ScramError::Malformed)?;
    if iterations == 0 {
        return Err(ScramError::Malformed);
    }

    Ok((nonce, salt, iterations))
}

// ============================================================================
// Helper Functions
// ============================================================================

/// `Hi(password, salt, i)`: iterated HMAC with XOR accumulation.
fn hi(password: &[u8], salt: &[u8], iterations: u32) -> Result<Vec<u8>, ScramError> {
    let mut first = Vec::with_capacity(salt.len() + 4);
    first.extend_from_slice(salt);
    first.extend_from_slice(&1u32.to_be_bytes());

    let mut u = hmac_sha256(password, &first)?;
    let mut result = u.clone();
    for _ in 1..iterations {
        u = hmac_sha256(password, &u)?;
        result = xor_bytes(&result, &u)?;
    }
    Ok(result)
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, ScramError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| ScramError::InvalidKey)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn sha256(data: &[u8]) -> Vec<u8> {
    Sha256::digest(data).to_vec()
}

fn xor_bytes(a: &[u8], b: &[u8]) -> Result<Vec<u8>, ScramError> {
    if a.len() != b.len() {
        return Err(ScramError::LengthMismatch(a.len(), b.len()));
    }
    Ok(a.iter().zip(b).map(|(x, y)| x ^ y).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 7677 section 3 exchange
    const CLIENT_NONCE: &str = "rOprNGfwEbeRWgbNEkqO";
    const SERVER_FIRST: &str =
        "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";
    const CLIENT_FINAL: &str = "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,\
                                p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ=";
    const SERVER_FINAL: &str = "v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=";

    fn client() -> ScramClient {
        ScramClient::with_nonce("user", "pencil", CLIENT_NONCE)
    }

    #[test]
    fn test_client_first_message() {
        assert_eq!(client().client_first_message(), "n,,n=user,r=rOprNGfwEbeRWgbNEkqO");
    }

    #[test]
    fn test_rfc7677_vectors() {
        let mut c = client();
        assert_eq!(c.process_server_first(SERVER_FIRST).unwrap(), CLIENT_FINAL);
        c.verify_server_final(SERVER_FINAL).unwrap();
    }

    #[test]
    fn test_corrupted_server_signature() {
        let mut c = client();
        c.process_server_first(SERVER_FIRST).unwrap();
        let err = c
            .verify_server_final("v=7rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=")
            .unwrap_err();
        assert_eq!(err, ScramError::SignatureMismatch);
    }

    #[test]
    fn test_verify_before_server_first() {
        assert_eq!(
            client().verify_server_final(SERVER_FINAL).unwrap_err(),
            ScramError::InvalidState
        );
    }

    #[test]
    fn test_nonce_must_extend_client_nonce() {
        let mut c = client();
        let err = c
            .process_server_first("r=somethingelse,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096")
            .unwrap_err();
        assert_eq!(err, ScramError::NonceMismatch);
    }

    #[test]
    fn test_bad_iteration_counts() {
        for iters in ["0", "-1", "abc", "", "1e3"] {
            let mut c = client();
            let msg = format!("r={}x,s=W22ZaJ0SNY7soEsUEjb6gQ==,i={}", CLIENT_NONCE, iters);
            assert_eq!(
                c.process_server_first(&msg).unwrap_err(),
                ScramError::Malformed,
                "i={}",
                iters
            );
        }
    }

    #[test]
    fn test_attribute_order_enforced() {
        let mut c = client();
        let msg = format!("s=W22ZaJ0SNY7soEsUEjb6gQ==,r={}x,i=4096", CLIENT_NONCE);
        assert_eq!(c.process_server_first(&msg).unwrap_err(), ScramError::Malformed);
    }

    #[test]
    fn test_hi_matches_pbkdf2() {
        for (password, salt, iterations) in [
            (&b"pencil"[..], &b"salt"[..], 1u32),
            (&b"pencil"[..], &b"W22ZaJ0SNY7soEsUEjb6gQ"[..], 2),
            (&b""[..], &b"x"[..], 4096),
            ("пароль".as_bytes(), &b"\x00\x01\x02"[..], 17),
        ] {
            let mut expected = [0u8; 32];
            pbkdf2::pbkdf2::<HmacSha256>(password, salt, iterations, &mut expected).unwrap();
            assert_eq!(hi(password, salt, iterations).unwrap(), expected.to_vec());
        }
    }

    #[test]
    fn test_xor_length_mismatch() {
        assert_eq!(
            xor_bytes(&[1, 2], &[1]).unwrap_err(),
            ScramError::LengthMismatch(2, 1)
        );
        assert!(ScramError::LengthMismatch(2, 1).is_internal());
    }

    #[test]
    fn test_username_nfkc() {
        // U+2168 ROMAN NUMERAL NINE normalizes to "IX"
        let c = ScramClient::with_nonce("\u{2168}", "pw", "abc");
        assert_eq!(c.client_first_message(), "n,,n=IX,r=abc");
    }

    #[test]
    fn test_password_nfkc() {
        // U+2168 ROMAN NUMERAL NINE normalizes to "IX"
        let mut composed = ScramClient::with_nonce("user", "\u{2168}", CLIENT_NONCE);
        let mut plain = ScramClient::with_nonce("user", "IX", CLIENT_NONCE);
        assert_eq!(
            composed.process_server_first(SERVER_FIRST).unwrap(),
            plain.process_server_first(SERVER_FIRST).unwrap()
        );
    }

    #[test]
    fn test_random_nonce_length() {
        let c = ScramClient::new("user", "pencil");
        // 18 bytes -> 24 base64 characters
        assert_eq!(c.client_nonce.len(), 24);
    }
}

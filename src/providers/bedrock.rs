//! AWS Bedrock upstream adapter.
//!
//! Bedrock has no bearer credential; every request is SigV4-signed with the
//! backend's access key pair against the bedrock-runtime endpoint for its
//! region. Only the signed headers are sent; arbitrary caller headers
//! would invalidate the signature.

use super::ProviderError;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use url::Url;

type HmacSha256 = Hmac<Sha256>;

const SERVICE: &str = "bedrock";
const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// Build a signed invoke request for the model.
pub fn build(
    client: &reqwest::Client,
    region: &str,
    access_key_id: &str,
    secret_access_key: &str,
    body: Vec<u8>,
    model_id: &str,
    stream: bool,
) -> Result<reqwest::RequestBuilder, ProviderError> {
    let action = if stream {
        "invoke-with-response-stream"
    } else {
        "invoke"
    };
    let url = Url::parse(&format!(
        "https://bedrock-runtime.{region}.amazonaws.com/model/{}/{action}",
        uri_encode(model_id)
    ))
    .map_err(|e| ProviderError::Request(format!("bedrock endpoint: {e}")))?;

    let signer = AwsRequestSigner {
        access_key_id: access_key_id.to_string(),
        secret_access_key: secret_access_key.to_string(),
        region: region.to_string(),
        service: SERVICE.to_string(),
    };
    let signed = signer.sign("POST", &url, &body, Utc::now())?;

    let mut request = client.post(url);
    for (name, value) in signed {
        request = request.header(name, value);
    }
    Ok(request
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(body))
}

/// SigV4 signer for one credential pair.
pub struct AwsRequestSigner {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub region: String,
    pub service: String,
}

impl AwsRequestSigner {
    /// Produce the headers that authenticate `method url body` at `now`:
    /// `host`, `x-amz-date`, `x-amz-content-sha256`, `authorization`.
    pub fn sign(
        &self,
        method: &str,
        url: &Url,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<Vec<(String, String)>, ProviderError> {
        let host = url
            .host_str()
            .ok_or_else(|| ProviderError::Request("url without host".into()))?
            .to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date_stamp = now.format("%Y%m%d").to_string();
        let payload_hash = hex::encode(Sha256::digest(body));

        let canonical_headers = format!(
            "content-type:application/json\nhost:{host}\nx-amz-content-sha256:{payload_hash}\nx-amz-date:{amz_date}\n"
        );
        let signed_headers = "content-type;host;x-amz-content-sha256;x-amz-date";

        let canonical_request = format!(
            "{method}\n{path}\n{query}\n{canonical_headers}\n{signed_headers}\n{payload_hash}",
            path = url.path(),
            query = url.query().unwrap_or(""),
        );

        let credential_scope = format!(
            "{date_stamp}/{}/{}/aws4_request",
            self.region, self.service
        );
        let string_to_sign = format!(
            "{ALGORITHM}\n{amz_date}\n{credential_scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let signing_key = self.derive_key(&date_stamp)?;
        let signature = hex::encode(hmac(&signing_key, string_to_sign.as_bytes())?);

        let authorization = format!(
            "{ALGORITHM} Credential={}/{credential_scope}, SignedHeaders={signed_headers}, Signature={signature}",
            self.access_key_id
        );

        Ok(vec![
            ("host".to_string(), host),
            ("x-amz-date".to_string(), amz_date),
            ("x-amz-content-sha256".to_string(), payload_hash),
            ("authorization".to_string(), authorization),
        ])
    }

    /// kSigning = HMAC(HMAC(HMAC(HMAC("AWS4"+secret, date), region), service), "aws4_request")
    fn derive_key(&self, date_stamp: &str) -> Result<Vec<u8>, ProviderError> {
        let k_date = hmac(
            format!("AWS4{}", self.secret_access_key).as_bytes(),
            date_stamp.as_bytes(),
        )?;
        let k_region = hmac(&k_date, self.region.as_bytes())?;
        let k_service = hmac(&k_region, self.service.as_bytes())?;
        hmac(&k_service, b"aws4_request")
    }
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>, ProviderError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| ProviderError::Request(format!("hmac key: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// RFC 3986 percent-encoding of a path segment: everything but unreserved
/// characters. Bedrock model ids carry ':' which must match the canonical
/// form byte for byte.
fn uri_encode(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

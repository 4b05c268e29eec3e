//! Payment gateway client and callback contract
//!
//! The gateway signs every message with an MD5 digest over the sorted,
//! filtered parameter set: `k1=v1&k2=v2&...&key=<shared secret>`, skipping
//! empty values and the `sign` field itself. Callbacks carry a fixed required
//! field set plus arbitrary additional signed fields, so the payload keeps an
//! open map of extras for the signature to cover exactly what was sent.

use std::collections::BTreeMap;

use md5::{Digest, Md5};
use quillcheck_shared::PayType;
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Base URL of the payment gateway API
    pub base_url: String,
    /// Merchant identifier issued by the gateway
    pub app_id: String,
    /// Shared signing secret
    pub secret: String,
    /// Absolute URL the gateway posts payment callbacks to
    pub notify_url: String,
}

/// MD5 signature over the sorted, filtered parameter set.
/// Empty values and any `sign` entry are excluded.
pub fn sign_params(params: &BTreeMap<String, String>, secret: &str) -> String {
    let mut canonical = String::new();
    for (key, value) in params {
        if key == "sign" || value.is_empty() {
            continue;
        }
        canonical.push_str(key);
        canonical.push('=');
        canonical.push_str(value);
        canonical.push('&');
    }
    canonical.push_str("key=");
    canonical.push_str(secret);

    hex::encode(Md5::digest(canonical.as_bytes()))
}

/// Gateway-reported payment outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeStatus {
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "FAILED")]
    Failed,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Success => "SUCCESS",
            TradeStatus::Failed => "FAILED",
        }
    }
}

/// Asynchronous payment callback from the gateway.
///
/// `order_id` carries our order_no; field names match the gateway's
/// documented contract exactly, since they participate in the signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayCallback {
    /// Our order_no, echoed back by the gateway
    pub order_id: String,
    /// The gateway's own transaction identifier
    pub trade_no: String,
    pub trade_status: TradeStatus,
    pub sign: String,
    /// Additional signed fields the gateway chose to send
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl GatewayCallback {
    /// The exact parameter set the gateway signed
    fn signable_params(&self) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        params.insert("order_id".to_string(), self.order_id.clone());
        params.insert("trade_no".to_string(), self.trade_no.clone());
        params.insert(
            "trade_status".to_string(),
            self.trade_status.as_str().to_string(),
        );
        for (key, value) in &self.extra {
            match value {
                serde_json::Value::Null => {}
                serde_json::Value::String(s) => {
                    params.insert(key.clone(), s.clone());
                }
                other => {
                    params.insert(key.clone(), other.to_string());
                }
            }
        }
        params
    }

    /// Verify the callback's signature against the shared secret
    pub fn verify(&self, secret: &str) -> bool {
        let expected = sign_params(&self.signable_params(), secret);
        expected.eq_ignore_ascii_case(&self.sign)
    }
}

/// A payment channel the billing core can request pay URLs from
pub trait PaymentGateway: Send + Sync {
    fn request_payment(
        &self,
        order_no: &str,
        amount_cents: i64,
        subject: &str,
        pay_type: PayType,
    ) -> impl std::future::Future<Output = BillingResult<String>> + Send;
}

#[derive(Debug, Deserialize)]
struct PayUrlResponse {
    pay_url: String,
}

/// HTTP client for the payment gateway
#[derive(Clone)]
pub struct HttpGateway {
    http: reqwest::Client,
    config: GatewayConfig,
}

impl HttpGateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }
}

impl PaymentGateway for HttpGateway {
    async fn request_payment(
        &self,
        order_no: &str,
        amount_cents: i64,
        subject: &str,
        pay_type: PayType,
    ) -> BillingResult<String> {
        let mut params = BTreeMap::new();
        params.insert("app_id".to_string(), self.config.app_id.clone());
        params.insert("order_id".to_string(), order_no.to_string());
        params.insert("amount".to_string(), amount_cents.to_string());
        params.insert("subject".to_string(), subject.to_string());
        params.insert("pay_type".to_string(), pay_type.as_str().to_string());
        params.insert("notify_url".to_string(), self.config.notify_url.clone());
        let sign = sign_params(&params, &self.config.secret);
        params.insert("sign".to_string(), sign);

        let url = format!("{}/v1/pay", self.config.base_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .form(&params)
            .send()
            .await
            .map_err(|e| BillingError::Gateway(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(BillingError::Gateway(format!(
                "gateway returned {}",
                response.status()
            )));
        }

        let body: PayUrlResponse = response
            .json()
            .await
            .map_err(|e| BillingError::Gateway(format!("invalid response body: {}", e)))?;

        tracing::info!(order_no = %order_no, amount_cents = amount_cents, "requested payment url");
        Ok(body.pay_url)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn callback(sign: &str) -> GatewayCallback {
        let mut extra = BTreeMap::new();
        extra.insert("amount".to_string(), json!("9900"));
        GatewayCallback {
            order_id: "20250101120000123456".to_string(),
            trade_no: "TN20250101001".to_string(),
            trade_status: TradeStatus::Success,
            sign: sign.to_string(),
            extra,
        }
    }

    #[test]
    fn sign_matches_precomputed_reference() {
        let mut params = BTreeMap::new();
        params.insert("b".to_string(), "2".to_string());
        params.insert("a".to_string(), "1".to_string());
        // md5("a=1&b=2&key=s3cr3t")
        assert_eq!(sign_params(&params, "s3cr3t"), "31e8e3a385bd1935ac35aff70725e871");
    }

    #[test]
    fn sign_skips_empty_values_and_sign_field() {
        let mut params = BTreeMap::new();
        params.insert("a".to_string(), "1".to_string());
        params.insert("b".to_string(), "2".to_string());
        let reference = sign_params(&params, "s3cr3t");

        params.insert("empty".to_string(), String::new());
        params.insert("sign".to_string(), "bogus".to_string());
        assert_eq!(sign_params(&params, "s3cr3t"), reference);
    }

    #[test]
    fn callback_with_valid_signature_verifies() {
        // md5("amount=9900&order_id=20250101120000123456&trade_no=TN20250101001\
        //      &trade_status=SUCCESS&key=secret123")
        let cb = callback("e742d6b7529d8ad7142a491f6c890ef7");
        assert!(cb.verify("secret123"));
        // Uppercase hex from the gateway is accepted too
        let cb = callback("E742D6B7529D8AD7142A491F6C890EF7");
        assert!(cb.verify("secret123"));
    }

    #[test]
    fn tampering_with_any_field_invalidates_signature() {
        let mut cb = callback("e742d6b7529d8ad7142a491f6c890ef7");
        cb.extra.insert("amount".to_string(), json!("9901"));
        assert!(!cb.verify("secret123"));

        let mut cb = callback("e742d6b7529d8ad7142a491f6c890ef7");
        cb.trade_status = TradeStatus::Failed;
        assert!(!cb.verify("secret123"));

        let cb = callback("e742d6b7529d8ad7142a491f6c890ef7");
        assert!(!cb.verify("wrong-secret"));
    }

    #[test]
    fn callback_deserializes_extra_signed_fields() {
        let cb: GatewayCallback = serde_json::from_value(json!({
            "order_id": "20250101120000123456",
            "trade_no": "TN1",
            "trade_status": "SUCCESS",
            "sign": "abc",
            "amount": "9900",
            "channel_serial": 42
        }))
        .expect("callback should deserialize");
        assert_eq!(cb.extra.len(), 2);
        let params = cb.signable_params();
        assert_eq!(params.get("amount").map(String::as_str), Some("9900"));
        assert_eq!(params.get("channel_serial").map(String::as_str), Some("42"));
    }
}

use crate::{error::GatewayError, switch::RawCallParams};
use serde::Serialize;
use std::collections::HashMap;

const CARRIER_ID_VAR: &str = "SIPCALLID";
const MAX_PROMPT_LEN: usize = 16 * 1024;

/// Validated parameters of a call.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct CallParams {
    /// The caller channel id, used as the canonical call id.
    pub call_id: String,
    pub caller: Option<String>,
    pub extension: Option<String>,
    /// Upstream carrier call id, registered as an alias.
    pub carrier_id: Option<String>,
    pub prompt: Option<String>,
    pub voice: Option<String>,
    pub greeting: Option<String>,
    /// Stasis arguments the gateway does not interpret.
    pub extra: HashMap<String, String>,
}

impl CallParams {
    pub fn parse(raw: &RawCallParams) -> Result<Self, GatewayError> {
        let call_id = raw.channel_id.trim();
        if call_id.is_empty() {
            return Err(GatewayError::InvalidParams("missing channel id".into()));
        }
        if call_id.chars().any(|c| c.is_whitespace() || c == '/') {
            return Err(GatewayError::InvalidParams(format!(
                "malformed channel id {:?}",
                call_id
            )));
        }

        let mut params = CallParams {
            call_id: call_id.to_string(),
            caller: raw.caller.clone(),
            extension: raw.extension.clone(),
            carrier_id: raw
                .variables
                .get(CARRIER_ID_VAR)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            ..Default::default()
        };

        for arg in &raw.args {
            let Some((key, value)) = arg.split_once('=') else {
                // positional args carry nothing we use
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();
            if value.is_empty() {
                return Err(GatewayError::InvalidParams(format!(
                    "empty value for {}",
                    key
                )));
            }
            match key.as_str() {
                "carrier_id" => params.carrier_id = Some(value.to_string()),
                "prompt" => {
                    if value.len() > MAX_PROMPT_LEN {
                        return Err(GatewayError::InvalidParams(format!(
                            "prompt longer than {} bytes",
                            MAX_PROMPT_LEN
                        )));
                    }
                    params.prompt = Some(value.to_string());
                }
                "voice" => {
                    if !value
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
                    {
                        return Err(GatewayError::InvalidParams(format!(
                            "invalid voice {:?}",
                            value
                        )));
                    }
                    params.voice = Some(value.to_string());
                }
                "greeting" => params.greeting = Some(value.to_string()),
                _ => {
                    params.extra.insert(key, value.to_string());
                }
            }
        }
        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(args: &[&str]) -> RawCallParams {
        RawCallParams {
            channel_id: "1714557600.17".to_string(),
            caller: Some("+15550100".to_string()),
            extension: Some("100".to_string()),
            args: args.iter().map(|s| s.to_string()).collect(),
            variables: HashMap::new(),
        }
    }

    #[test]
    fn test_parse_overrides() {
        let params = CallParams::parse(&raw(&[
            "inbound",
            "voice=verse",
            "prompt=You book dentist appointments.",
            "greeting=Say hello and ask for their name",
            "Campaign=spring",
        ]))
        .unwrap();
        assert_eq!(params.call_id, "1714557600.17");
        assert_eq!(params.voice.as_deref(), Some("verse"));
        assert_eq!(
            params.prompt.as_deref(),
            Some("You book dentist appointments.")
        );
        assert!(params.greeting.is_some());
        assert_eq!(params.extra.get("campaign").map(String::as_str), Some("spring"));
    }

    #[test]
    fn test_carrier_id_sources() {
        let mut from_var = raw(&[]);
        from_var
            .variables
            .insert("SIPCALLID".to_string(), "abc@carrier".to_string());
        assert_eq!(
            CallParams::parse(&from_var).unwrap().carrier_id.as_deref(),
            Some("abc@carrier")
        );

        let mut from_arg = from_var.clone();
        from_arg.args.push("carrier_id=xyz".to_string());
        assert_eq!(
            CallParams::parse(&from_arg).unwrap().carrier_id.as_deref(),
            Some("xyz")
        );
    }

    #[test]
    fn test_rejects_bad_input() {
        let mut missing = raw(&[]);
        missing.channel_id = " ".to_string();
        assert!(matches!(
            CallParams::parse(&missing),
            Err(GatewayError::InvalidParams(_))
        ));
        assert!(CallParams::parse(&raw(&["voice=al loy"])).is_err());
        assert!(CallParams::parse(&raw(&["prompt="])).is_err());

        let long = format!("prompt={}", "x".repeat(MAX_PROMPT_LEN + 1));
        assert!(CallParams::parse(&raw(&[long.as_str()])).is_err());
    }
}

use serde_json::json;

use crate::core::error::InvokeError;
use crate::core::orchestrator::{InvokeRequest, MediaRef, merge_params, validate_params};
use crate::core::testing;

#[test]
fn caller_params_override_defaults_and_null_removes() {
    let defaults = json!({"size": "1024x1024", "n": 1, "style": "vivid"});
    let params = json!({"n": 2, "style": null, "prompt": "a fox"});
    let merged = merge_params(
        defaults.as_object().unwrap(),
        params.as_object().unwrap(),
    );
    assert_eq!(merged["size"], "1024x1024");
    assert_eq!(merged["n"], 2);
    assert_eq!(merged["prompt"], "a fox");
    assert!(!merged.contains_key("style"));
}

#[test]
fn blank_required_params_are_rejected() {
    let capability = testing::http_capability("txt2img", "/v1/images");
    let params = json!({"prompt": "  "});
    let err = validate_params(&capability, params.as_object().unwrap(), false).unwrap_err();
    assert!(matches!(err, InvokeError::InvalidRequest(ref m) if m.contains("prompt")));
}

#[test]
fn image_capabilities_need_media() {
    let mut capability = testing::queue_capability("img2video");
    capability.requires_image = true;
    let params = json!({"prompt": "waves"});
    assert!(validate_params(&capability, params.as_object().unwrap(), false).is_err());
    assert!(validate_params(&capability, params.as_object().unwrap(), true).is_ok());
}

#[test]
fn requests_accept_camel_and_snake_case() {
    let camel: InvokeRequest = serde_json::from_value(json!({
        "capabilityId": "txt2img",
        "params": {"prompt": "x"},
        "media": "https://cdn.test/in.png",
        "callbackUrl": "https://hooks.test/done"
    }))
    .unwrap();
    assert_eq!(camel.capability_id, "txt2img");
    assert_eq!(camel.media, Some(MediaRef::Url("https://cdn.test/in.png".into())));
    assert_eq!(camel.callback_url.as_deref(), Some("https://hooks.test/done"));

    let snake: InvokeRequest = serde_json::from_value(json!({
        "capability_id": "txt2img",
        "media": {"data": "aGVsbG8=", "content_type": "image/png"}
    }))
    .unwrap();
    assert!(matches!(snake.media, Some(MediaRef::Inline { .. })));
}

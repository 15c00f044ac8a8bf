//! Tests for the payment claim queue: public submission, admin
//! resolution, and the gateway callback.

use axum::http::StatusCode;
use serde_json::json;

mod common;
use common::*;

fn claim_body(code: &str) -> serde_json::Value {
    json!({
        "transactionCode": code,
        "phone": "0712345678",
        "email": "jane@example.com",
        "paymentMethod": "mpesa",
        "amount": 20000.0
    })
}

#[tokio::test]
async fn submission_succeeds_once_then_conflicts() {
    let (app, _store) = test_app();

    let first = send_json(&app, "POST", "/payments", claim_body("abc12345")).await;
    assert_eq!(first.status(), StatusCode::OK);
    let body = body_json(first).await;
    assert_eq!(body["success"], true);
    // The code is normalized before storage; the caller sees the
    // normalized form as the verification id.
    assert_eq!(body["verificationId"], "ABC12345");

    let duplicate = send_json(&app, "POST", "/payments", claim_body("ABC12345")).await;
    assert_eq!(duplicate.status(), StatusCode::CONFLICT);

    // Different spacing/case, same code.
    let recased = send_json(&app, "POST", "/payments", claim_body("  Abc12345 ")).await;
    assert_eq!(recased.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn submission_validation_failures() {
    let (app, store) = test_app();

    let short_code = send_json(&app, "POST", "/payments", claim_body("AB1")).await;
    assert_eq!(short_code.status(), StatusCode::BAD_REQUEST);

    let mut bad_email = claim_body("ABC12345");
    bad_email["email"] = json!("janeexample.com");
    let response = send_json(&app, "POST", "/payments", bad_email).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let mut bad_phone = claim_body("ABC12345");
    bad_phone["phone"] = json!("12345");
    let response = send_json(&app, "POST", "/payments", bad_phone).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    use keydesk::store::PaymentStore;
    assert!(store.list_payments(true).unwrap().is_empty());
}

#[tokio::test]
async fn verify_mints_an_activatable_license() {
    let (app, _store) = test_app();

    let submitted = send_json(&app, "POST", "/payments", claim_body("ABC12345")).await;
    assert_eq!(submitted.status(), StatusCode::OK);

    let resolved = send_json_admin(
        &app,
        "PUT",
        "/payments",
        json!({ "transactionCode": "ABC12345", "action": "verify" }),
    )
    .await;
    assert_eq!(resolved.status(), StatusCode::OK);
    let body = body_json(resolved).await;
    let key = body["licenseKey"].as_str().unwrap().to_string();
    assert!(key.starts_with("EIMS-"));

    // The minted key activates on a fresh device.
    let activated = send_json(
        &app,
        "POST",
        "/activate",
        json!({ "key": key, "deviceId": "fresh-device" }),
    )
    .await;
    assert_eq!(activated.status(), StatusCode::OK);
    let body = body_json(activated).await;
    assert_eq!(body["license"]["email"], "jane@example.com");
}

#[tokio::test]
async fn claim_with_device_pre_binds_the_license() {
    let (app, _store) = test_app();

    let mut claim = claim_body("ABC12345");
    claim["deviceId"] = json!("customer-laptop");
    send_json(&app, "POST", "/payments", claim).await;

    let resolved = send_json_admin(
        &app,
        "PUT",
        "/payments",
        json!({ "transactionCode": "ABC12345", "action": "verify" }),
    )
    .await;
    let key = body_json(resolved).await["licenseKey"]
        .as_str()
        .unwrap()
        .to_string();

    // Only the submitting device may activate.
    let other = send_json(
        &app,
        "POST",
        "/activate",
        json!({ "key": key, "deviceId": "someone-else" }),
    )
    .await;
    assert_eq!(other.status(), StatusCode::FORBIDDEN);

    let ours = send_json(
        &app,
        "POST",
        "/activate",
        json!({ "key": key, "deviceId": "customer-laptop" }),
    )
    .await;
    assert_eq!(ours.status(), StatusCode::OK);
}

#[tokio::test]
async fn reject_records_the_reason_and_is_terminal() {
    let (app, store) = test_app();

    send_json(&app, "POST", "/payments", claim_body("ABC12345")).await;

    let rejected = send_json_admin(
        &app,
        "PUT",
        "/payments",
        json!({ "transactionCode": "ABC12345", "action": "reject" }),
    )
    .await;
    assert_eq!(rejected.status(), StatusCode::OK);
    let body = body_json(rejected).await;
    assert_eq!(body["reason"], "Payment could not be verified");

    use keydesk::store::PaymentStore;
    let payment = store.get_payment("ABC12345").unwrap().unwrap();
    assert_eq!(payment.resolved_by.as_deref(), Some("admin"));

    // Double resolution is an operator input error.
    let again = send_json_admin(
        &app,
        "PUT",
        "/payments",
        json!({ "transactionCode": "ABC12345", "action": "verify" }),
    )
    .await;
    assert_eq!(again.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn resolve_input_errors_are_400() {
    let (app, _store) = test_app();

    let unknown = send_json_admin(
        &app,
        "PUT",
        "/payments",
        json!({ "transactionCode": "NOSUCH99", "action": "verify" }),
    )
    .await;
    assert_eq!(unknown.status(), StatusCode::BAD_REQUEST);

    send_json(&app, "POST", "/payments", claim_body("ABC12345")).await;
    let bad_action = send_json_admin(
        &app,
        "PUT",
        "/payments",
        json!({ "transactionCode": "ABC12345", "action": "approve" }),
    )
    .await;
    assert_eq!(bad_action.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn operator_identity_comes_from_the_header() {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    let (app, store) = test_app();

    send_json(&app, "POST", "/payments", claim_body("AAA11111")).await;
    send_json(&app, "POST", "/payments", claim_body("BBB22222")).await;

    // Without x-operator the resolver is recorded as "admin".
    let response = send_json_admin(
        &app,
        "PUT",
        "/payments",
        json!({ "transactionCode": "AAA11111", "action": "reject", "reason": "no match" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let with_header = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/payments")
                .header("authorization", format!("Bearer {ADMIN_KEY}"))
                .header("x-operator", "wanjiku")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({ "transactionCode": "BBB22222", "action": "reject" }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(with_header.status(), StatusCode::OK);

    use keydesk::store::PaymentStore;
    let first = store.get_payment("AAA11111").unwrap().unwrap();
    assert_eq!(first.resolved_by.as_deref(), Some("admin"));
    assert_eq!(first.rejection_reason.as_deref(), Some("no match"));
    let second = store.get_payment("BBB22222").unwrap().unwrap();
    assert_eq!(second.resolved_by.as_deref(), Some("wanjiku"));
}

#[tokio::test]
async fn listing_filters_resolved_claims() {
    let (app, _store) = test_app();

    send_json(&app, "POST", "/payments", claim_body("AAA11111")).await;
    send_json(&app, "POST", "/payments", claim_body("BBB22222")).await;
    send_json_admin(
        &app,
        "PUT",
        "/payments",
        json!({ "transactionCode": "AAA11111", "action": "reject" }),
    )
    .await;

    let pending = body_json(get_admin(&app, "/payments").await).await;
    assert_eq!(pending["total"], 1);
    assert_eq!(pending["payments"][0]["transactionCode"], "BBB22222");

    let all = body_json(get_admin(&app, "/payments?all=true").await).await;
    assert_eq!(all["total"], 2);
}

#[tokio::test]
async fn payment_admin_endpoints_require_the_token() {
    let (app, _store) = test_app();

    let list = send(&app, "GET", "/payments", None, None).await;
    assert_eq!(list.status(), StatusCode::UNAUTHORIZED);

    let resolve = send_json(
        &app,
        "PUT",
        "/payments",
        json!({ "transactionCode": "ABC12345", "action": "verify" }),
    )
    .await;
    assert_eq!(resolve.status(), StatusCode::UNAUTHORIZED);
}

fn stk_callback(receipt: &str) -> serde_json::Value {
    json!({
        "Body": {
            "stkCallback": {
                "MerchantRequestID": "29115-34620561-1",
                "CheckoutRequestID": "ws_CO_191220191020363925",
                "ResultCode": 0,
                "ResultDesc": "The service request is processed successfully.",
                "CallbackMetadata": {
                    "Item": [
                        { "Name": "Amount", "Value": 20000.0 },
                        { "Name": "MpesaReceiptNumber", "Value": receipt },
                        { "Name": "PhoneNumber", "Value": 254712345678u64 }
                    ]
                }
            }
        }
    })
}

#[tokio::test]
async fn gateway_callback_creates_one_pending_claim() {
    let (app, store) = test_app();

    let first = send_json(&app, "POST", "/payments/callback", stk_callback("NLJ7RT61SV")).await;
    assert_eq!(first.status(), StatusCode::OK);
    let body = body_json(first).await;
    assert_eq!(body["ResultCode"], 0);

    // Redelivery is acknowledged without a second record.
    let again = send_json(&app, "POST", "/payments/callback", stk_callback("NLJ7RT61SV")).await;
    assert_eq!(again.status(), StatusCode::OK);

    use keydesk::models::PaymentStatus;
    use keydesk::store::PaymentStore;
    let payments = store.list_payments(true).unwrap();
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].transaction_code, "NLJ7RT61SV");
    assert_eq!(payments[0].status, PaymentStatus::Pending);
    assert_eq!(payments[0].amount, Some(20000.0));
}

#[tokio::test]
async fn failed_gateway_callback_is_acked_but_not_recorded() {
    let (app, store) = test_app();

    let cancelled = json!({
        "Body": {
            "stkCallback": {
                "MerchantRequestID": "29115-34620561-1",
                "CheckoutRequestID": "ws_CO_191220191020363925",
                "ResultCode": 1032,
                "ResultDesc": "Request cancelled by user."
            }
        }
    });
    let response = send_json(&app, "POST", "/payments/callback", cancelled).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["ResultCode"], 0);

    use keydesk::store::PaymentStore;
    assert!(store.list_payments(true).unwrap().is_empty());
}

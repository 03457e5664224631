mod support;

use device_relay_core::coap::{Code, ContentFormat};
use device_relay_core::contract::{AUTH_PATH, RELAY_PATH};
use device_relay_core::error::RelayError;
use device_relay_core::relay::relay_event;
use device_relay_core::session::TransportError;
use device_relay_core::test_helpers::{fixed_now, BrokerBehavior, FakeBroker};
use support::invocation::{seeded_config, TestDevice};

#[test]
fn relays_payload_after_authenticating() {
    let device = TestDevice::new("dev-1", "deadbeef");
    let broker = FakeBroker::new(device.verifying_broker());

    let response = relay_event(Some(&device.event), &seeded_config(), &broker, fixed_now())
        .expect("relay should succeed");

    assert_eq!(response.status_code, 200);

    let log = broker.log();
    assert_eq!(log.connects.len(), 1);
    assert_eq!(log.paths(), vec![AUTH_PATH, RELAY_PATH]);
    assert_eq!(log.authenticated_subjects, vec!["dev-1".to_string()]);

    assert_eq!(
        log.requests[0].content_format,
        Some(ContentFormat::TEXT_PLAIN)
    );
    assert_eq!(
        log.requests[1].content_format,
        Some(ContentFormat::APPLICATION_CBOR)
    );
    assert_eq!(log.requests[1].payload, vec![0xde, 0xad, 0xbe, 0xef]);
    assert_eq!(log.closes, 1);
}

#[test]
fn absent_event_is_bad_request_without_network() {
    let broker = FakeBroker::accepting();

    let response =
        relay_event(None, &seeded_config(), &broker, fixed_now()).expect("relay should answer");

    assert_eq!(response.status_code, 400);
    let log = broker.log();
    assert!(log.connects.is_empty());
    assert_eq!(log.datagrams, 0);
}

#[test]
fn malformed_hex_is_bad_request_after_authentication() {
    let device = TestDevice::new("dev-1", "zz");
    let broker = FakeBroker::new(device.verifying_broker());

    let response = relay_event(Some(&device.event), &seeded_config(), &broker, fixed_now())
        .expect("relay should answer");

    assert_eq!(response.status_code, 400);

    let log = broker.log();
    assert_eq!(log.paths(), vec![AUTH_PATH]);
    assert_eq!(log.authenticated_subjects, vec!["dev-1".to_string()]);
    assert_eq!(log.closes, 1);
}

#[test]
fn rejected_authentication_fails_and_releases_session() {
    let device = TestDevice::new("dev-1", "deadbeef");
    let broker = FakeBroker::new(BrokerBehavior {
        auth_code: Code::UNAUTHORIZED,
        ..BrokerBehavior::default()
    });

    let error = relay_event(Some(&device.event), &seeded_config(), &broker, fixed_now())
        .expect_err("relay should fail");

    assert_eq!(
        error,
        RelayError::UnexpectedResponseStatus {
            path: AUTH_PATH.to_string(),
            expected: Code::CREATED,
            actual: Code::UNAUTHORIZED,
        }
    );
    assert_eq!(error.status_code(), None);

    let log = broker.log();
    assert_eq!(log.paths(), vec![AUTH_PATH]);
    assert_eq!(log.closes, 1);
}

#[test]
fn credential_signed_by_another_key_is_rejected() {
    let device = TestDevice::new("dev-1", "deadbeef");
    let impostor = TestDevice::new("dev-1", "deadbeef");
    let broker = FakeBroker::new(impostor.verifying_broker());

    let error = relay_event(Some(&device.event), &seeded_config(), &broker, fixed_now())
        .expect_err("relay should fail");

    assert!(matches!(
        error,
        RelayError::UnexpectedResponseStatus {
            actual: Code::UNAUTHORIZED,
            ..
        }
    ));
    assert!(broker.log().authenticated_subjects.is_empty());
}

#[test]
fn rejected_relay_fails_and_releases_session() {
    let device = TestDevice::new("dev-1", "deadbeef");
    let broker = FakeBroker::new(BrokerBehavior {
        relay_code: Code::INTERNAL_SERVER_ERROR,
        ..device.verifying_broker()
    });

    let error = relay_event(Some(&device.event), &seeded_config(), &broker, fixed_now())
        .expect_err("relay should fail");

    assert_eq!(
        error,
        RelayError::UnexpectedResponseStatus {
            path: RELAY_PATH.to_string(),
            expected: Code::CREATED,
            actual: Code::INTERNAL_SERVER_ERROR,
        }
    );

    let log = broker.log();
    assert_eq!(log.paths(), vec![AUTH_PATH, RELAY_PATH]);
    assert_eq!(log.closes, 1);
}

#[test]
fn connect_failure_is_fatal() {
    let device = TestDevice::new("dev-1", "deadbeef");
    let broker = FakeBroker::new(BrokerBehavior {
        fail_connect: Some(TransportError::Handshake {
            endpoint: "coap.nrfcloud.com:5684".to_string(),
            reason: "alert: handshake failure".to_string(),
        }),
        ..BrokerBehavior::default()
    });

    let error = relay_event(Some(&device.event), &seeded_config(), &broker, fixed_now())
        .expect_err("relay should fail");

    assert!(matches!(
        error,
        RelayError::Transport(TransportError::Handshake { .. })
    ));
    assert_eq!(broker.log().closes, 0);
}

#[test]
fn empty_payload_is_relayed_as_empty_body() {
    let device = TestDevice::new("dev-1", "");
    let broker = FakeBroker::new(device.verifying_broker());

    let response = relay_event(Some(&device.event), &seeded_config(), &broker, fixed_now())
        .expect("relay should succeed");

    assert_eq!(response.status_code, 200);
    assert!(broker.log().requests[1].payload.is_empty());
}

#[test]
fn verification_is_enabled_by_default() {
    let device = TestDevice::new("dev-1", "00");
    let broker = FakeBroker::accepting();

    relay_event(Some(&device.event), &seeded_config(), &broker, fixed_now())
        .expect("relay should succeed");

    let log = broker.log();
    assert!(!log.connect_options[0].insecure_skip_verify);
}

use clinic_lake_etl::config::lake_config::{ClinicConfig, ExtractionSettings};
use clinic_lake_etl::domain::ports::EmbryoscopeApi;
use clinic_lake_etl::{EmbryoscopeClient, EtlError};
use httpmock::prelude::*;
use serde_json::json;

fn clinic() -> ClinicConfig {
    ClinicConfig {
        name: "Ibirapuera".to_string(),
        ip: "127.0.0.1".to_string(),
        port: 4000,
        login: "lab".to_string(),
        password: "secret".to_string(),
        enabled: true,
    }
}

fn fast_settings() -> ExtractionSettings {
    ExtractionSettings {
        rate_limit_delay_ms: 0,
        retry_backoff_ms: 1,
        max_retries: 3,
        timeout_seconds: 5,
        ..ExtractionSettings::default()
    }
}

fn client_for(server: &MockServer) -> EmbryoscopeClient {
    EmbryoscopeClient::with_base_url(&clinic(), server.base_url(), &fast_settings()).unwrap()
}

async fn mock_login(server: &MockServer) -> httpmock::Mock<'_> {
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/LOGIN")
                .query_param("username", "lab")
                .query_param("password", "secret");
            then.status(200).json_body(json!({ "Token": "tok-1" }));
        })
        .await
}

#[tokio::test]
async fn test_token_is_sent_and_cached() {
    let server = MockServer::start_async().await;
    let login = mock_login(&server).await;
    let patients = server
        .mock_async(|when, then| {
            when.method(GET).path("/GET/patients").header("API-token", "tok-1");
            then.status(200)
                .json_body(json!({ "Patients": [{ "PatientIDx": "P1", "PatientID": 100 }] }));
        })
        .await;

    let client = client_for(&server);
    let body = client.get_patients().await.unwrap().unwrap();
    assert_eq!(body["Patients"][0]["PatientIDx"], "P1");
    client.get_patients().await.unwrap();

    login.assert_hits_async(1).await;
    patients.assert_hits_async(2).await;
}

#[tokio::test]
async fn test_query_parameters_for_embryo_data() {
    let server = MockServer::start_async().await;
    mock_login(&server).await;
    let embryos = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/GET/embryodata")
                .query_param("PatientIDx", "P1")
                .query_param("TreatmentName", "T 2024");
            then.status(200)
                .json_body(json!({ "EmbryoDataList": [{ "EmbryoID": "E1" }] }));
        })
        .await;

    let client = client_for(&server);
    let body = client.get_embryo_data("P1", "T 2024").await.unwrap().unwrap();
    assert_eq!(body["EmbryoDataList"][0]["EmbryoID"], "E1");
    embryos.assert_hits_async(1).await;
}

#[tokio::test]
async fn test_unauthorized_reauthenticates_once() {
    let server = MockServer::start_async().await;
    let login = mock_login(&server).await;
    let patients = server
        .mock_async(|when, then| {
            when.method(GET).path("/GET/patients");
            then.status(401);
        })
        .await;

    let client = client_for(&server);
    let err = tokio_test::assert_err!(client.get_patients().await);
    assert!(matches!(err, EtlError::AuthenticationError { .. }));
    login.assert_hits_async(2).await;
    patients.assert_hits_async(2).await;
}

#[tokio::test]
async fn test_server_errors_are_retried_then_reported() {
    let server = MockServer::start_async().await;
    mock_login(&server).await;
    let scores = server
        .mock_async(|when, then| {
            when.method(GET).path("/GET/IDASCORE");
            then.status(503);
        })
        .await;

    let client = client_for(&server);
    let err = client.get_idascore().await.unwrap_err();
    assert!(err.is_retryable());
    match err {
        EtlError::ApiStatusError { endpoint, status } => {
            assert_eq!(endpoint, "GET/IDASCORE");
            assert_eq!(status, 503);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    scores.assert_hits_async(3).await;
}

#[tokio::test]
async fn test_empty_body_is_none() {
    let server = MockServer::start_async().await;
    mock_login(&server).await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/GET/TREATMENT").query_param("patientIDx", "P9");
            then.status(200).body("  ");
        })
        .await;

    let client = client_for(&server);
    assert!(client.get_treatments("P9").await.unwrap().is_none());
}

#[tokio::test]
async fn test_invalid_json_is_processing_error() {
    let server = MockServer::start_async().await;
    mock_login(&server).await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/GET/ongoingpatients");
            then.status(200).body("<html>maintenance</html>");
        })
        .await;

    let client = client_for(&server);
    let err = client.get_ongoing_patients().await.unwrap_err();
    match err {
        EtlError::ProcessingError { message } => {
            assert!(message.contains("GET/ongoingpatients"));
            assert!(message.contains("maintenance"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_login_without_token_fails() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/LOGIN");
            then.status(200).json_body(json!({ "Error": "bad credentials" }));
        })
        .await;

    let client = client_for(&server);
    let err = client.authenticate().await.unwrap_err();
    assert!(matches!(err, EtlError::AuthenticationError { .. }));
    assert!(!client.test_connection().await);
}

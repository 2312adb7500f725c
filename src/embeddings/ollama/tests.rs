use super::*;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

fn client_for(server: &MockServer, batch_size: u32) -> OllamaClient {
    let base_url = Url::parse(&server.uri()).expect("mock server uri parses");
    OllamaClient::from_url(base_url, "nomic-embed-text:latest", batch_size)
        .with_timeout(Duration::from_secs(5))
}

#[test]
fn client_configuration() {
    let config = OllamaConfig {
        host: "test-host".to_string(),
        port: 1234,
        model: "test-model".to_string(),
        batch_size: 128,
        timeout_seconds: 5,
        ..OllamaConfig::default()
    };
    let client = OllamaClient::new(&config).expect("Failed to create client");

    assert_eq!(client.model, "test-model");
    assert_eq!(client.batch_size, 128);
    assert_eq!(client.base_url.host_str(), Some("test-host"));
    assert_eq!(client.base_url.port(), Some(1234));
}

#[tokio::test(flavor = "multi_thread")]
async fn batch_embedding_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(r#"{"embeddings": [[0.1, 0.2, 0.3], [0.4, 0.5, 0.6]]}"#),
        )
        .mount(&server)
        .await;

    let embedder = OllamaEmbedder::from_client(client_for(&server, 16), 3, 1000);
    let vectors = embedder
        .embed_batch(&["a".to_string(), "b".to_string()])
        .await
        .expect("embedding succeeds");

    assert_eq!(vectors, vec![vec![0.1, 0.2, 0.3], vec![0.4, 0.5, 0.6]]);
    assert_eq!(embedder.identity(), "ollama:nomic-embed-text:latest");
}

#[tokio::test(flavor = "multi_thread")]
async fn wrong_dimension_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"embeddings": [[0.1]]}"#))
        .mount(&server)
        .await;

    let embedder = OllamaEmbedder::from_client(client_for(&server, 16), 3, 1000);
    let result = embedder.embed("a").await;

    assert!(matches!(result, Err(WeaveError::Embedding(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn server_errors_are_transient_and_tried_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let embedder = OllamaEmbedder::from_client(client_for(&server, 16), 3, 1000);
    let error = embedder.embed("a").await.expect_err("server keeps failing");

    assert!(error.is_transient());
}

#[tokio::test(flavor = "multi_thread")]
async fn client_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(400))
        .expect(1)
        .mount(&server)
        .await;

    let embedder = OllamaEmbedder::from_client(client_for(&server, 16), 3, 1000);
    let error = embedder.embed("a").await.expect_err("bad request fails");

    assert!(!error.is_transient());
}

#[tokio::test(flavor = "multi_thread")]
async fn health_check_requires_model() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(r#"{"models": [{"name": "other:latest"}]}"#),
        )
        .mount(&server)
        .await;

    let embedder = OllamaEmbedder::from_client(client_for(&server, 16), 3, 1000);
    assert!(embedder.health_check().await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn oversized_input_never_reaches_server() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let embedder = OllamaEmbedder::from_client(client_for(&server, 16), 3, 4);
    let result = embedder.embed("too long").await;

    assert!(matches!(result, Err(WeaveError::Embedding(_))));
}

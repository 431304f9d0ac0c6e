use client::RpcClient;
use mockito::Server;
use serde_json::{json, Value};

#[tokio::test]
async fn call_method_returns_result_field() {
    let mut server = Server::new_with_opts(mockito::ServerOpts::default());
    let mock = server
        .mock("POST", "/")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"jsonrpc":"2.0","result":42,"id":1}"#)
        .create();

    let client = RpcClient::new(&server.url());
    let res = client.call_method("foo", &[json!(123)]).await.unwrap();
    assert_eq!(res, Value::from(42));
    mock.assert();
}

#[tokio::test]
async fn call_method_with_complex_result() {
    let mut server = Server::new_with_opts(mockito::ServerOpts::default());
    let mock = server
        .mock("POST", "/")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"jsonrpc":"2.0","result":{"name":"test","sum":15,"details":["a","b"]},"id":1}"#)
        .create();

    let client = RpcClient::new(&server.url());
    let res = client.call_method("foo", &[]).await.unwrap();
    assert_eq!(
        res,
        json!({
            "name": "test",
            "sum": 15,
            "details": ["a", "b"]
        })
    );
    mock.assert();
}

#[tokio::test]
async fn call_method_sends_basic_auth_header() {
    let mut server = Server::new_with_opts(mockito::ServerOpts::default());
    let mock = server
        .mock("POST", "/")
        .match_header("authorization", "Basic dXNlcjpwYXNz")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"jsonrpc":"2.0","result":42,"id":1}"#)
        .create();

    let client = RpcClient::new_with_auth(&server.url(), "user", "pass");
    let res = client.call_method("foo", &[json!(123)]).await.unwrap();
    assert_eq!(res, Value::from(42));
    mock.assert();
}

#[tokio::test]
async fn rpc_error_object_is_propagated_as_err() {
    let mut server = Server::new_with_opts(mockito::ServerOpts::default());
    let mock = server
        .mock("POST", "/")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"jsonrpc":"2.0","error":{"code":-32603,"message":"Internal error"},"id":1}"#)
        .create();

    let client = RpcClient::new(&server.url());
    let res = client.call_method("foo", &[json!(123)]).await;
    assert!(res.is_err());
    mock.assert();
}

#[tokio::test]
async fn http_error_status_is_propagated_as_err() {
    let mut server = Server::new_with_opts(mockito::ServerOpts::default());
    let mock = server
        .mock("POST", "/")
        .with_status(500)
        .with_header("content-type", "application/json")
        .with_body(r#"{"error":"Internal Server Error"}"#)
        .create();

    let client = RpcClient::new(&server.url());
    let res = client.call_method("foo", &[]).await;
    assert!(res.is_err());
    mock.assert();
}

#[tokio::test]
async fn invalid_json_body_is_propagated_as_err() {
    let mut server = Server::new_with_opts(mockito::ServerOpts::default());
    let mock = server
        .mock("POST", "/")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"jsonrpc":"2.0","result":invalid,"id":1}"#)
        .create();

    let client = RpcClient::new(&server.url());
    let res = client.call_method("foo", &[]).await;
    assert!(res.is_err());
    mock.assert();
}

#[tokio::test]
async fn missing_result_field_is_propagated_as_err() {
    let mut server = Server::new_with_opts(mockito::ServerOpts::default());
    let mock = server
        .mock("POST", "/")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"jsonrpc":"2.0","id":1}"#)
        .create();

    let client = RpcClient::new(&server.url());
    let res = client.call_method("foo", &[]).await;
    assert!(res.is_err());
    mock.assert();
}

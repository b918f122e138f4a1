//! Integration tests for the link handshake over TCP.

use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

use bytes::Bytes;
use trellis_core::{read_frame, write_frame, Frame};
use trellis_crypto::wrap::{unwrap, wrap};
use trellis_crypto::{initiate, open, respond, seal, HandshakeError, Identity, SessionKey};

const STEP: Duration = Duration::from_secs(5);

/// Full handshake over loopback sockets, then one sealed message each way.
#[tokio::test]
async fn test_handshake_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr().unwrap();

    let server_handle = tokio::spawn(async move {
        let server = Identity::generate();
        let (mut stream, _) = listener.accept().await.unwrap();
        let link = respond(&mut stream, &server, STEP).await.unwrap();

        let frame = read_frame(&mut stream).await.unwrap();
        let Frame::Envelope(body) = frame else {
            panic!("expected envelope frame");
        };
        assert_eq!(open(&link.key, &body).unwrap(), b"Hello from client!");

        let reply = seal(&link.key, b"Hello from server!").unwrap();
        write_frame(&mut stream, &Frame::Envelope(Bytes::from(reply)))
            .await
            .unwrap();

        (server.public(), link.remote)
    });

    let client = Identity::generate();
    let mut stream = TcpStream::connect(server_addr).await.unwrap();
    let link = initiate(&mut stream, &client, STEP).await.unwrap();

    let sealed = seal(&link.key, b"Hello from client!").unwrap();
    write_frame(&mut stream, &Frame::Envelope(Bytes::from(sealed)))
        .await
        .unwrap();

    let Frame::Envelope(body) = read_frame(&mut stream).await.unwrap() else {
        panic!("expected envelope frame");
    };
    assert_eq!(open(&link.key, &body).unwrap(), b"Hello from server!");

    let (server_public, seen_by_server) = server_handle.await.unwrap();
    assert_eq!(link.remote, server_public);
    assert_eq!(seen_by_server, client.public());
}

/// A key wrapped for a substituted responder cannot be unwrapped by the real one.
#[tokio::test]
async fn test_substituted_responder_key_fails_unwrap() {
    let real = Identity::generate();
    let impostor = Identity::generate();

    let key = SessionKey::generate();
    let wrapped = wrap(&key, &impostor.public()).unwrap();

    assert!(unwrap(&wrapped, &real).is_err());
    assert_eq!(unwrap(&wrapped, &impostor).unwrap(), key);
}

/// A man in the middle that swaps the responder's PublicKeyMsg breaks the link:
/// the responder fails to unwrap and no key is agreed.
#[tokio::test]
async fn test_key_substitution_on_the_wire() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        respond(&mut stream, &Identity::generate(), STEP).await
    });

    let impostor = Identity::generate();
    let mut upstream = TcpStream::connect(addr).await.unwrap();

    // Relay the client's key, drop the server's, present the impostor's instead.
    let (mut client_side, mut relay_side) = tokio::io::duplex(4096);
    let relay = tokio::spawn(async move {
        let hello = read_frame(&mut relay_side).await.unwrap();
        write_frame(&mut upstream, &hello).await.unwrap();
        let _server_key = read_frame(&mut upstream).await.unwrap();
        let forged = Frame::PublicKey(Bytes::copy_from_slice(&impostor.public().to_bytes()));
        write_frame(&mut relay_side, &forged).await.unwrap();
        let wrapped = read_frame(&mut relay_side).await.unwrap();
        write_frame(&mut upstream, &wrapped).await.unwrap();
    });

    let client = initiate(&mut client_side, &Identity::generate(), STEP)
        .await
        .unwrap();
    relay.await.unwrap();

    let result = server.await.unwrap();
    assert!(matches!(result, Err(HandshakeError::Crypto(_))));
    drop(client);
}

/// A peer that connects and never speaks is cut off by the step timeout.
#[tokio::test]
async fn test_handshake_timeout() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let _silent = TcpStream::connect(addr).await.unwrap();
    let (mut stream, _) = listener.accept().await.unwrap();

    let result = respond(&mut stream, &Identity::generate(), Duration::from_millis(100)).await;
    assert!(matches!(result, Err(HandshakeError::Timeout(_))));
}

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::future::join_all;
use runnel::client::Endpoint;
use runnel::server::Server;
use runnel::stream::DirectionState;
use runnel::transport::tcp::TcpIncoming;
use runnel::Code;
use runnel_greet::client::GreeterClient;
use runnel_greet::pb::{GreetRequest, Greeting, Numbers};
use runnel_greet::server::{GreetService, GreeterServer};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

struct TestServer {
    addr: SocketAddr,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<Result<(), runnel::transport::Error>>,
}

async fn serve(service: GreetService) -> TestServer {
    let incoming = TcpIncoming::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let addr = incoming.local_addr();
    let (stop, stopped) = oneshot::channel::<()>();

    let handle = tokio::spawn(
        Server::builder()
            .add_service(GreeterServer::new(service))
            .serve_with_listener(incoming, async {
                let _ = stopped.await;
            }),
    );

    TestServer { addr, stop, handle }
}

async fn connect(server: &TestServer) -> GreeterClient {
    GreeterClient::connect(server.addr.to_string()).await.unwrap()
}

#[tokio::test]
async fn unary_over_tcp() {
    let server = serve(GreetService::default()).await;
    let client = connect(&server).await;

    let response = client
        .greet(Greeting::full("Ann", "Lee").into())
        .await
        .unwrap();

    assert_eq!(response.result, "Hi Ann Lee");
}

#[tokio::test]
async fn server_stream_over_tcp() {
    let server = serve(GreetService::new().greet_count(3)).await;
    let client = connect(&server).await;

    let mut stream = client
        .greet_many_times(Greeting::first("Ann").into())
        .await
        .unwrap();

    let mut results = Vec::new();
    while let Some(response) = stream.message().await.unwrap() {
        results.push(response.result);
    }

    assert_eq!(
        results,
        vec![
            "Hello Ann : number = 0",
            "Hello Ann : number = 1",
            "Hello Ann : number = 2",
        ]
    );
}

#[tokio::test]
async fn client_stream_over_tcp() {
    let server = serve(GreetService::default()).await;
    let client = connect(&server).await;

    let requests = tokio_stream::iter(
        ["a", "b", "c"]
            .into_iter()
            .map(|name| GreetRequest::from(Greeting::first(name))),
    );
    let response = client.long_greet(requests).await.unwrap();

    assert_eq!(response.result, "Hello a! Hello b! Hello c! ");
}

#[tokio::test]
async fn running_maximum_over_tcp() {
    let server = serve(GreetService::default()).await;
    let client = connect(&server).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let numbers = tokio_stream::iter([1, 5, 3, 6, 2, 20].into_iter().map(Numbers::from));
    let summary = client
        .find_maximum(numbers, move |max| {
            let _ = tx.send(max.number);
        })
        .await
        .unwrap();
    assert_eq!(summary.received, 6);

    let mut out = Vec::new();
    while let Ok(max) = rx.try_recv() {
        out.push(max);
    }
    assert_eq!(out, vec![1, 5, 5, 6, 6, 20]);
}

#[tokio::test]
async fn calls_share_one_connection() {
    let server = serve(GreetService::new().greet_count(5)).await;
    let client = connect(&server).await;

    let unary = join_all((0..16).map(|i| {
        let client = client.clone();
        async move {
            client
                .greet(Greeting::full(format!("n{}", i), "x").into())
                .await
        }
    }))
    .await;
    for (i, response) in unary.into_iter().enumerate() {
        assert_eq!(response.unwrap().result, format!("Hi n{} x", i));
    }

    let mut streams = Vec::new();
    for i in 0..4 {
        streams.push(
            client
                .greet_many_times(Greeting::first(format!("s{}", i)).into())
                .await
                .unwrap(),
        );
    }
    for (i, stream) in streams.iter_mut().enumerate() {
        let mut count = 0;
        while let Some(response) = stream.message().await.unwrap() {
            assert!(response.result.starts_with(&format!("Hello s{} : number =", i)));
            count += 1;
        }
        assert_eq!(count, 5);
    }
}

#[tokio::test]
async fn cancelled_call_leaves_the_connection_usable() {
    let server = serve(GreetService::default()).await;
    let client = connect(&server).await;

    let (mut tx, mut rx) = client.greet_every_one_stream().await.unwrap();
    tx.send(Greeting::first("Ann").into()).await.unwrap();
    assert_eq!(rx.message().await.unwrap().unwrap().result, "Hello Ann! ");

    tx.cancel_handle().cancel();
    assert_eq!(rx.message().await.unwrap_err().code(), Code::Cancelled);

    // The connection is still usable by other calls.
    let response = client.greet(Greeting::first("Bob").into()).await.unwrap();
    assert_eq!(response.result, "Hi Bob");
}

#[tokio::test]
async fn deadline_over_tcp() {
    let server = serve(
        GreetService::new()
            .greet_count(100)
            .stream_delay(Duration::from_millis(50)),
    )
    .await;
    let client = connect(&server).await.timeout(Duration::from_millis(120));

    let mut stream = client
        .greet_many_times(Greeting::first("Ann").into())
        .await
        .unwrap();

    let err = loop {
        match stream.message().await {
            Ok(Some(_)) => {}
            Ok(None) => panic!("stream ended before the deadline"),
            Err(status) => break status,
        }
    };
    assert_eq!(err.code(), Code::DeadlineExceeded);
}

#[tokio::test]
async fn shutdown_stops_the_server() {
    let server = serve(GreetService::default()).await;
    let client = connect(&server).await;
    client.greet(Greeting::first("Ann").into()).await.unwrap();

    server.stop.send(()).unwrap();
    server.handle.await.unwrap().unwrap();

    // The connection outlives the listener, but new calls are turned away.
    let err = client
        .greet(Greeting::first("Bob").into())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Transport);
}

#[tokio::test]
async fn unread_stream_does_not_stall_other_calls() {
    let server = serve(GreetService::new().greet_count(2_000_000)).await;
    let client = connect(&server).await;

    // Left unread, so the server soon runs out of credit for it.
    let mut flood = client
        .greet_many_times(Greeting::first("Ann").into())
        .await
        .unwrap();

    let response = tokio::time::timeout(
        Duration::from_secs(3),
        client.greet(Greeting::first("Bob").into()),
    )
    .await
    .expect("unary call stalled behind an unread stream")
    .unwrap();
    assert_eq!(response.result, "Hi Bob");

    // The stalled stream picks up where it stopped once it is read.
    for i in 0..500 {
        let response = flood.message().await.unwrap().unwrap();
        assert_eq!(response.result, format!("Hello Ann : number = {}", i));
    }
}

#[tokio::test]
async fn connection_lost_mid_call_fails_both_directions() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let client = GreeterClient::connect(addr.to_string()).await.unwrap();
    let (socket, _) = listener.accept().await.unwrap();

    let (mut tx, mut rx) = client.find_maximum_stream().await.unwrap();
    tx.send(Numbers::from(1)).await.unwrap();

    drop(socket);

    assert_eq!(rx.message().await.unwrap_err().code(), Code::Transport);
    assert_eq!(rx.state(), DirectionState::Closed);

    let err = tx.send(Numbers::from(2)).await.unwrap_err();
    assert_eq!(err.code(), Code::Transport);
    assert_eq!(tx.state(), DirectionState::Closed);

    // Calls opened afterwards fail straight away.
    let err = client
        .greet(Greeting::first("Ann").into())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Transport);
}

#[tokio::test]
async fn oversized_frame_fails_the_connection() {
    let server = serve(GreetService::default()).await;
    let channel = Endpoint::from_shared(server.addr.to_string())
        .max_message_size(1024)
        .connect()
        .await
        .unwrap();
    let client = GreeterClient::new(channel);

    // The request fits the server's limit, the echoed greeting does not fit
    // the client's.
    let err = client
        .greet(Greeting::first("x".repeat(4096)).into())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Transport);
    assert!(err.message().contains("too large"), "{}", err);

    let err = client
        .greet(Greeting::first("Ann").into())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Transport);
}

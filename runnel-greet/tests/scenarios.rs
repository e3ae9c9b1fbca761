use std::time::Duration;

use runnel::client::Channel;
use runnel::server::Server;
use runnel::stream::DirectionState;
use runnel::transport::inmemory;
use runnel::Code;
use runnel_greet::client::GreeterClient;
use runnel_greet::pb::{GreetRequest, Greeting, Numbers};
use runnel_greet::server::{GreetService, GreeterServer, ReductionPolicy};
use tokio::sync::mpsc;
use tokio::time::Instant;

fn serve(service: GreetService) -> GreeterClient {
    let (transport, listener) = inmemory::pair();

    tokio::spawn(
        Server::builder()
            .add_service(GreeterServer::new(service))
            .serve_with_listener(listener, std::future::pending()),
    );

    GreeterClient::new(Channel::from_transport(transport))
}

fn names(names: &[&str]) -> impl tokio_stream::Stream<Item = GreetRequest> + Send + 'static {
    let requests = names
        .iter()
        .map(|name| GreetRequest::from(Greeting::first(*name)))
        .collect::<Vec<_>>();
    tokio_stream::iter(requests)
}

async fn maxima(service: GreetService, input: &[i32]) -> Vec<i32> {
    let client = serve(service);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let numbers = tokio_stream::iter(input.iter().copied().map(Numbers::from).collect::<Vec<_>>());
    let summary = client
        .find_maximum(numbers, move |max| {
            let _ = tx.send(max.number);
        })
        .await
        .unwrap();
    assert_eq!(summary.sent, input.len());

    let mut out = Vec::new();
    while let Ok(max) = rx.try_recv() {
        out.push(max);
    }
    assert_eq!(summary.received, out.len());
    out
}

#[tokio::test]
async fn unary_greets_full_name() {
    let client = serve(GreetService::default());

    let response = client
        .greet(Greeting::full("Ann", "Lee").into())
        .await
        .unwrap();

    assert_eq!(response.result, "Hi Ann Lee");
}

#[tokio::test]
async fn server_stream_emits_numbered_greetings_then_ends() {
    let client = serve(GreetService::new().greet_count(3));

    let mut stream = client
        .greet_many_times(Greeting::first("Ann").into())
        .await
        .unwrap();

    for i in 0..3 {
        let response = stream.message().await.unwrap().unwrap();
        assert_eq!(response.result, format!("Hello Ann : number = {}", i));
    }
    assert!(stream.message().await.unwrap().is_none());
    assert_eq!(stream.state(), DirectionState::Closed);
    assert_eq!(stream.stats().received, 3);

    let err = stream.message().await.unwrap_err();
    assert_eq!(err.code(), Code::InvalidState);
}

#[tokio::test]
async fn server_stream_defaults_to_ten_greetings() {
    let client = serve(GreetService::default());

    let mut stream = client
        .greet_many_times(Greeting::full("Ann", "Lee").into())
        .await
        .unwrap();

    let mut results = Vec::new();
    while let Some(response) = stream.message().await.unwrap() {
        results.push(response.result);
    }

    assert_eq!(results.len(), 10);
    assert_eq!(results[9], "Hello Ann Lee : number = 9");
}

#[tokio::test]
async fn client_stream_greets_everybody_once_closed() {
    let client = serve(GreetService::default());

    let response = client.long_greet(names(&["a", "b", "c"])).await.unwrap();

    assert_eq!(response.result, "Hello a! Hello b! Hello c! ");
}

#[tokio::test]
async fn client_stream_with_no_requests_is_empty() {
    let client = serve(GreetService::default());

    let response = client.long_greet(names(&[])).await.unwrap();

    assert_eq!(response.result, "");
}

#[tokio::test]
async fn bidi_echo_is_one_to_one_and_ordered() {
    let client = serve(GreetService::default());
    let input = (0..64).map(|i| format!("n{}", i)).collect::<Vec<_>>();
    let requests = tokio_stream::iter(
        input
            .clone()
            .into_iter()
            .map(|name| GreetRequest::from(Greeting::first(name))),
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    let summary = client
        .greet_every_one(requests, move |response| {
            let _ = tx.send(response.result);
        })
        .await
        .unwrap();

    assert_eq!(summary.sent, 64);
    assert_eq!(summary.received, 64);
    for name in input {
        assert_eq!(rx.try_recv().unwrap(), format!("Hello {}! ", name));
    }
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn running_maximum_reports_every_input() {
    let out = maxima(GreetService::default(), &[1, 5, 3, 6, 2, 20]).await;
    assert_eq!(out, vec![1, 5, 5, 6, 6, 20]);
}

#[tokio::test]
async fn running_maximum_reports_changes_only() {
    let service = GreetService::new().reduction(ReductionPolicy::OnChange);
    let out = maxima(service, &[1, 5, 3, 6, 2, 20]).await;
    assert_eq!(out, vec![1, 5, 6, 20]);
}

#[tokio::test]
async fn running_maximum_reports_once_at_the_end() {
    let service = GreetService::new().reduction(ReductionPolicy::Final);
    assert_eq!(maxima(service.clone(), &[1, 5, 3, 6, 2, 20]).await, vec![20]);
    assert_eq!(maxima(service, &[]).await, Vec::<i32>::new());
}

#[tokio::test]
async fn running_maximum_handles_negative_numbers() {
    let out = maxima(GreetService::default(), &[-7, -9, -3]).await;
    assert_eq!(out, vec![-7, -7, -3]);
}

#[tokio::test]
async fn closed_directions_reject_every_retry() {
    let client = serve(GreetService::default());
    let (mut tx, mut rx) = client.greet_every_one_stream().await.unwrap();

    tx.send(Greeting::first("Ann").into()).await.unwrap();
    tx.close_send().await.unwrap();
    assert_eq!(tx.state(), DirectionState::Closed);

    for _ in 0..3 {
        let err = tx.send(Greeting::first("Bob").into()).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidState);
    }
    assert_eq!(tx.close_send().await.unwrap_err().code(), Code::InvalidState);

    assert_eq!(rx.message().await.unwrap().unwrap().result, "Hello Ann! ");
    assert!(rx.message().await.unwrap().is_none());

    for _ in 0..3 {
        assert_eq!(rx.message().await.unwrap_err().code(), Code::InvalidState);
        let err = tx.send(Greeting::first("Bob").into()).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidState);
    }
    assert_eq!(tx.state(), DirectionState::Closed);
}

#[tokio::test]
async fn cancel_wakes_both_directions() {
    let client = serve(GreetService::default());
    let (mut tx, mut rx) = client.find_maximum_stream().await.unwrap();

    tx.send(Numbers::from(4)).await.unwrap();
    assert_eq!(rx.message().await.unwrap(), Some(Numbers::from(4)));

    let handle = rx.cancel_handle();
    let blocked = tokio::spawn(async move { rx.message().await });
    tokio::task::yield_now().await;
    handle.cancel();

    let err = blocked.await.unwrap().unwrap_err();
    assert_eq!(err.code(), Code::Cancelled);

    let err = tx.send(Numbers::from(5)).await.unwrap_err();
    assert_eq!(err.code(), Code::Cancelled);
    assert_eq!(tx.state(), DirectionState::Closed);
    assert!(handle.is_terminal());
}

#[tokio::test(start_paused = true)]
async fn deadline_cuts_a_slow_stream_short() {
    let service = GreetService::new().stream_delay(Duration::from_secs(1));
    let client = serve(service).timeout(Duration::from_millis(2500));

    let mut stream = client
        .greet_many_times(Greeting::first("Ann").into())
        .await
        .unwrap();

    let mut received = 0;
    let err = loop {
        match stream.message().await {
            Ok(Some(_)) => received += 1,
            Ok(None) => panic!("stream ended before the deadline"),
            Err(status) => break status,
        }
    };

    assert_eq!(received, 3);
    assert_eq!(err.code(), Code::DeadlineExceeded);
}

#[tokio::test(start_paused = true)]
async fn stream_delay_paces_greetings() {
    let service = GreetService::new()
        .greet_count(4)
        .stream_delay(Duration::from_millis(500));
    let client = serve(service);
    let start = Instant::now();

    let mut stream = client
        .greet_many_times(Greeting::first("Ann").into())
        .await
        .unwrap();
    while stream.message().await.unwrap().is_some() {}

    assert!(start.elapsed() >= Duration::from_millis(1500));
    assert!(start.elapsed() < Duration::from_millis(2000));
}

#[tokio::test(start_paused = true)]
async fn client_pacing_spaces_out_requests() {
    let client = serve(GreetService::default()).pacing(Duration::from_secs(1));
    let start = Instant::now();

    let response = client.long_greet(names(&["a", "b", "c"])).await.unwrap();

    assert_eq!(response.result, "Hello a! Hello b! Hello c! ");
    assert!(start.elapsed() >= Duration::from_secs(2));
}

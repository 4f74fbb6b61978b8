#![cfg(feature = "serde")]
mod common;

use mhub::{
    ClientMessage, FireAndForget, ReceiverTable, Response, ServerMessage, SessionOptions, Value,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
struct JoinRequest {
    room: String,
    user: String,
}

#[derive(Debug, Deserialize, PartialEq)]
struct Member {
    id: u32,
    name: String,
}

#[tokio::test]
async fn test_typed_call_round_trip() {
    let (session, mut hub) = common::connect(ReceiverTable::new(), SessionOptions::new()).await;

    let join_request = JoinRequest {
        room: "lobby".into(),
        user: "ada".into(),
    };
    let call = session.call_typed::<_, Vec<Member>>(20, &join_request);
    let serve = async {
        let request = match hub.recv().await {
            Some(ClientMessage::Request(request)) => request,
            other => panic!("expected request, got {:?}", other),
        };
        // Structs travel as positional arrays.
        assert_eq!(
            request.args,
            Value::Array(vec![Value::from("lobby"), Value::from("ada")])
        );
        hub.send(ServerMessage::Response(Response {
            message_id: request.message_id,
            method_id: request.method_id,
            result: Value::Array(vec![Value::Array(vec![
                Value::from(1),
                Value::from("ada"),
            ])]),
        }))
        .await;
    };
    let (members, ()) = tokio::join!(call, serve);

    assert_eq!(
        members.unwrap(),
        vec![Member {
            id: 1,
            name: "ada".into(),
        }]
    );
    session.dispose().await;
}

#[tokio::test]
async fn test_typed_fire_and_forget() {
    let (session, mut hub) = common::connect(ReceiverTable::new(), SessionOptions::new()).await;
    session.fire_and_forget_typed(21, &("hello", 3)).unwrap();
    assert_eq!(
        hub.recv().await,
        Some(ClientMessage::FireAndForget(FireAndForget {
            method_id: 21,
            args: Value::Array(vec![Value::from("hello"), Value::from(3)]),
        }))
    );
    session.dispose().await;
}

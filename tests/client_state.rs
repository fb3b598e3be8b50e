//! Client login sequence driven message by message, without sockets

#![allow(clippy::unwrap_used, clippy::panic)]

use p7_protocol::protocol::key_exchange::password_digest;
use p7_protocol::service::client::{Action, ClientState, ClientStateMachine, Identity};
use p7_protocol::{Message, Specification};
use std::sync::Arc;

fn spec() -> Arc<Specification> {
    Arc::new(Specification::from_xml(include_str!("../specs/wired.xml")).unwrap())
}

fn identity() -> Identity {
    Identity {
        nick: "Morris".into(),
        status: "Away".into(),
        icon: vec![0x89, b'P', b'N', b'G'],
        ..Identity::new("morris", "hunter2")
    }
}

fn sent(actions: Vec<Action>) -> Vec<Message> {
    actions
        .into_iter()
        .map(|action| match action {
            Action::Send(message) => message,
            other => panic!("expected a send, got {other:?}"),
        })
        .collect()
}

#[test]
fn test_full_login_sequence() {
    let spec = spec();
    let mut machine = ClientStateMachine::new(Arc::clone(&spec), identity());

    let opening = machine.start().unwrap();
    assert_eq!(opening.name(), "wired.client_info");
    assert_eq!(
        opening.string("wired.info.application.name"),
        Some(env!("CARGO_PKG_NAME"))
    );
    assert_eq!(opening.string("wired.info.os.name"), Some(std::env::consts::OS));

    let info = Message::new(&spec, "wired.server_info")
        .unwrap()
        .with("wired.info.name", "Lobby")
        .unwrap()
        .with("wired.info.application.name", "p7d")
        .unwrap();
    let presence = sent(machine.handle(info).unwrap());
    assert_eq!(presence.len(), 3);
    assert_eq!(presence[0].string("wired.user.nick"), Some("Morris"));
    assert_eq!(presence[1].string("wired.user.status"), Some("Away"));
    assert_eq!(presence[2].data("wired.user.icon"), Some(&[0x89, b'P', b'N', b'G'][..]));

    let okay = Message::new(&spec, "wired.okay").unwrap();
    assert!(machine.handle(okay.clone()).unwrap().is_empty());
    assert!(machine.handle(okay.clone()).unwrap().is_empty());
    let login = sent(machine.handle(okay).unwrap());
    assert_eq!(login[0].name(), "wired.send_login");
    assert_eq!(login[0].string("wired.user.login"), Some("morris"));
    let digest = password_digest("hunter2");
    assert_eq!(login[0].string("wired.user.password"), Some(digest.as_str()));
    assert_eq!(machine.state(), ClientState::ClientLogin);
    assert!(machine.login_info().is_none());

    let reply = Message::new(&spec, "wired.login")
        .unwrap()
        .with("wired.user.id", 12u32)
        .unwrap();
    assert!(machine.handle(reply).unwrap().is_empty());

    let privileges = Message::new(&spec, "wired.account.privileges")
        .unwrap()
        .with("wired.account.chat.set_topic", true)
        .unwrap()
        .with("wired.account.transfer.upload_files", true)
        .unwrap();
    assert!(matches!(
        machine.handle(privileges).unwrap().as_slice(),
        [Action::Connected(_)]
    ));

    let info = machine.login_info().unwrap();
    assert_eq!(info.user_id, 12);
    assert_eq!(info.server_name.as_deref(), Some("Lobby"));
    assert_eq!(info.server_application.as_deref(), Some("p7d"));
    assert_eq!(
        info.privileges,
        [
            "wired.account.chat.set_topic",
            "wired.account.transfer.upload_files"
        ]
    );
}

#[test]
fn test_messages_out_of_order_are_ignored() {
    let spec = spec();
    let mut machine = ClientStateMachine::new(Arc::clone(&spec), identity());

    for name in [
        "wired.login",
        "wired.account.privileges",
        "wired.chat.user_status",
        "wired.send_ping",
    ] {
        let message = Message::new(&spec, name).unwrap();
        assert!(machine.handle(message).unwrap().is_empty(), "{name}");
        assert_eq!(machine.state(), ClientState::ClientInfo);
    }

    machine
        .handle(Message::new(&spec, "wired.server_info").unwrap())
        .unwrap();
    let early = Message::new(&spec, "wired.login").unwrap();
    assert!(machine.handle(early).unwrap().is_empty());
    assert_eq!(machine.state(), ClientState::ClientUser);

    // An error before login is ignored outside the login step
    let error = Message::new(&spec, "wired.error").unwrap();
    assert!(machine.handle(error).unwrap().is_empty());
}

#[test]
fn test_steady_state_routing() {
    let spec = spec();
    let mut machine = ClientStateMachine::new(Arc::clone(&spec), Identity::new("guest", ""));
    machine
        .handle(Message::new(&spec, "wired.server_info").unwrap())
        .unwrap();
    for _ in 0..3 {
        machine
            .handle(Message::new(&spec, "wired.okay").unwrap())
            .unwrap();
    }
    machine
        .handle(Message::new(&spec, "wired.login").unwrap())
        .unwrap();
    machine
        .handle(Message::new(&spec, "wired.account.privileges").unwrap())
        .unwrap();
    assert_eq!(machine.state(), ClientState::ClientPrivileges);
    assert!(machine.login_info().unwrap().privileges.is_empty());

    let say = Message::new(&spec, "wired.chat.say")
        .unwrap()
        .with("wired.chat.say", "hi")
        .unwrap();
    match machine.handle(say).unwrap().as_slice() {
        [Action::Forward(message)] => assert_eq!(message.string("wired.chat.say"), Some("hi")),
        other => panic!("unexpected {other:?}"),
    }

    let mut denied = Message::new(&spec, "wired.error").unwrap();
    denied
        .set_enum("wired.error", "wired.error.permission_denied")
        .unwrap();
    match machine.handle(denied).unwrap().as_slice() {
        [Action::ApplicationError(message)] => assert_eq!(
            spec.error_for_message(message).unwrap().name,
            "wired.error.permission_denied"
        ),
        other => panic!("unexpected {other:?}"),
    }
}

//! Login and bridge binding before the concurrent phase starts.

mod common;

use std::time::Duration;

use common::{config, unstarted};
use pinbridge::{
    BridgeError,
    MessageType,
    SessionConfig,
    SessionState,
    Status,
};
use rstest::rstest;

#[rstest]
#[tokio::test]
async fn accepted_login_authenticates(config: SessionConfig) {
    let (mut session, mut peer) = unstarted(config);
    assert_eq!(session.state(), SessionState::Connecting);

    let server = async {
        let login = peer.recv().await;
        assert_eq!(login.kind(), MessageType::Login);
        assert_eq!(login.id(), 2, "first request id");
        assert_eq!(login.body().as_ref(), b"secret-token");
        peer.respond(login.id(), Status::OK).await;
    };
    let (result, ()) = tokio::join!(session.establish(), server);

    result.expect("authenticated");
    assert_eq!(session.state(), SessionState::Authenticated);
}

#[rstest]
#[tokio::test]
async fn refused_login_closes_session(config: SessionConfig) {
    let (mut session, mut peer) = unstarted(config);
    let server = async {
        let login = peer.recv().await;
        peer.respond(login.id(), Status::new(403)).await;
    };
    let (result, ()) = tokio::join!(session.establish(), server);

    let err = result.expect_err("refused");
    assert!(matches!(err, BridgeError::AuthFailure(status) if status.code() == 403));
    assert_eq!(session.state(), SessionState::Closed);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn silent_server_times_out_login(config: SessionConfig) {
    let (mut session, mut peer) = unstarted(config);
    let server = async {
        let login = peer.recv().await;
        assert_eq!(login.kind(), MessageType::Login);
    };
    let (result, ()) = tokio::join!(session.establish(), server);

    assert!(matches!(result, Err(BridgeError::Timeout { id: 2, .. })));
    assert_eq!(session.state(), SessionState::Closed);
}

#[rstest]
#[tokio::test]
async fn closed_session_cannot_start(config: SessionConfig) {
    let (mut session, mut peer) = unstarted(config);
    let server = async {
        let login = peer.recv().await;
        peer.respond(login.id(), Status::new(500)).await;
    };
    let (result, ()) = tokio::join!(session.establish(), server);
    assert!(result.is_err());
    let bus = std::sync::Arc::new(pinbridge::test_helpers::RecordingBus::new());
    assert!(matches!(session.start(bus), Err(BridgeError::SessionClosed)));
}

#[rstest]
#[tokio::test]
async fn links_bind_in_declaration_order(mut config: SessionConfig) {
    config.bridges = vec!["First".into(), "Second".into()];
    let (mut session, mut peer) = unstarted(config);
    let server = async {
        let login = peer.recv().await;
        peer.respond(login.id(), Status::OK).await;
        for expected in [b"1\0i\0First".as_slice(), b"2\0i\0Second".as_slice()] {
            let bind = peer.recv().await;
            assert_eq!(bind.kind(), MessageType::Bridge);
            assert_eq!(bind.body().as_ref(), expected);
            peer.respond(bind.id(), Status::OK).await;
        }
    };
    let (result, ()) = tokio::join!(session.establish(), server);

    result.expect("bound");
    assert!(session.links().iter().all(|link| link.is_bound()));
}

#[rstest]
#[tokio::test]
async fn refused_bind_stops_later_links(mut config: SessionConfig) {
    config.bridges = vec!["First".into(), "Second".into()];
    let (mut session, mut peer) = unstarted(config);
    let server = async {
        let login = peer.recv().await;
        peer.respond(login.id(), Status::OK).await;
        let bind = peer.recv().await;
        assert_eq!(bind.body().as_ref(), b"1\0i\0First");
        peer.respond(bind.id(), Status::new(404)).await;
    };
    let (result, ()) = tokio::join!(session.establish(), server);

    let err = result.expect_err("bind refused");
    let BridgeError::BindFailure { index, reason } = err else {
        panic!("expected a bind failure, got {err:?}");
    };
    assert_eq!(index, 1);
    assert!(matches!(*reason, BridgeError::Rejected { status, .. } if status.code() == 404));
    assert_eq!(session.state(), SessionState::Closed);
    assert!(session.links().iter().all(|link| !link.is_bound()));
    assert!(
        peer.try_recv(Duration::from_millis(100)).await.is_none(),
        "second link must never be sent"
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn unanswered_bind_is_fatal(mut config: SessionConfig) {
    config.bridges = vec!["First".into(), "Second".into()];
    let (mut session, mut peer) = unstarted(config);
    let server = async {
        let login = peer.recv().await;
        peer.respond(login.id(), Status::OK).await;
        let bind = peer.recv().await;
        assert_eq!(bind.kind(), MessageType::Bridge);
    };
    let (result, ()) = tokio::join!(session.establish(), server);

    assert!(matches!(
        result,
        Err(BridgeError::BindFailure { index: 1, ref reason })
            if matches!(**reason, BridgeError::Timeout { .. })
    ));
    assert!(peer.try_recv(Duration::from_secs(1)).await.is_none());
}

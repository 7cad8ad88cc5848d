use router_stream::{ByteStream, StreamError};

/// Bytes moved by one forwarding session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

/// Copies `src` into `dst` until `src` ends, then finishes `dst`'s write
/// half. Disconnects on either side end the leg quietly.
async fn copy_leg<S, D>(leg: &'static str, src: &S, dst: &D) -> Result<u64, StreamError>
where
    S: ByteStream + ?Sized,
    D: ByteStream + ?Sized,
{
    let mut copied = 0u64;
    let outcome = loop {
        let chunk = match src.receive().await {
            Ok(chunk) => chunk,
            Err(err) if err.is_disconnect() => break Ok(()),
            Err(err) => break Err(err),
        };
        let len = chunk.len() as u64;
        match dst.send(chunk).await {
            Ok(()) => copied += len,
            Err(err) if err.is_disconnect() => break Ok(()),
            Err(err) => break Err(err),
        }
    };

    if let Err(err) = dst.send_eof().await {
        if !err.is_disconnect() {
            tracing::debug!(
                target = "jumpstarter::streams::forward",
                leg,
                error = %err,
                "failed to propagate eof"
            );
        }
    }

    tracing::trace!(
        target = "jumpstarter::streams::forward",
        leg,
        bytes = copied,
        ok = outcome.is_ok(),
        "copy leg finished"
    );
    outcome.map(|_| copied)
}

/// Forwards two streams into each other until both directions have ended.
///
/// Both streams are closed on return, whichever leg finished first. Dropping
/// the returned future cancels both legs. Only non-disconnect failures, such
/// as a corrupt compressed stream, are reported as errors.
pub async fn forward<A, B>(a: A, b: B) -> Result<ForwardStats, StreamError>
where
    A: ByteStream,
    B: ByteStream,
{
    let (a_to_b, b_to_a) = tokio::join!(copy_leg("a->b", &a, &b), copy_leg("b->a", &b, &a));

    for (side, result) in [("a", a.close().await), ("b", b.close().await)] {
        if let Err(err) = result {
            tracing::trace!(
                target = "jumpstarter::streams::forward",
                side,
                error = %err,
                "close after forward failed"
            );
        }
    }

    Ok(ForwardStats {
        a_to_b: a_to_b?,
        b_to_a: b_to_a?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::SocketStream;
    use bytes::Bytes;
    use router_stream::memory::call_pair;
    use router_stream::{RequestCallStream, ResponseCallStream};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test_timeout::tokio_timeout_test(10)]
    async fn forwards_socket_through_router_call() {
        // app <-> socket A | forward | request call <-> response call (remote end)
        let (app_io, bridge_io) = tokio::io::duplex(1024);
        let (client_call, server_call) = call_pair(16);
        let remote = ResponseCallStream::new(server_call);

        let task = tokio::spawn(forward(
            SocketStream::new(bridge_io),
            RequestCallStream::new(client_call),
        ));

        let (mut app_read, mut app_write) = tokio::io::split(app_io);
        app_write.write_all(b"driver request").await.expect("write");
        app_write.shutdown().await.expect("shutdown");

        let mut received = Vec::new();
        loop {
            match remote.receive().await {
                Ok(chunk) => received.extend_from_slice(&chunk),
                Err(StreamError::EndOfStream) => break,
                Err(err) => panic!("unexpected error {err}"),
            }
        }
        assert_eq!(received, b"driver request");

        remote
            .send(Bytes::from_static(b"driver reply"))
            .await
            .expect("reply");
        remote.send_eof().await.expect("eof");

        let mut reply = Vec::new();
        app_read.read_to_end(&mut reply).await.expect("read reply");
        assert_eq!(reply, b"driver reply");

        let stats = task.await.expect("join").expect("forward");
        assert_eq!(stats.a_to_b, 14);
        assert_eq!(stats.b_to_a, 12);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn broken_side_ends_quietly_and_closes_both() {
        let (app_io, bridge_io) = tokio::io::duplex(1024);
        let (client_call, server_call) = call_pair(16);
        let remote = Arc::new(ResponseCallStream::new(server_call));
        let bridge = Arc::new(SocketStream::new(bridge_io));

        let task = tokio::spawn(forward(bridge.clone(), RequestCallStream::new(client_call)));

        // Abort the remote end: the call side turns into a broken resource.
        remote.close().await.expect("close");
        drop(app_io);

        let stats = task.await.expect("join").expect("forward suppresses disconnects");
        assert_eq!(stats, ForwardStats::default());
        assert_eq!(
            bridge.send(Bytes::from_static(b"x")).await,
            Err(StreamError::ClosedResource)
        );
    }
}

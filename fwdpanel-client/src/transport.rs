use std::pin::Pin;

use futures::{
    Sink, SinkExt, Stream, StreamExt,
    future::{self, BoxFuture},
    stream,
};
use tokio_tungstenite::{connect_async, tungstenite, tungstenite::Message};

use crate::error::ChannelError;

pub type FrameSink = Pin<Box<dyn Sink<String, Error = ChannelError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, ChannelError>> + Send>>;

/// One physical socket, reduced to text frames in each direction.
///
/// The stream ends when the peer closes. An error item alone does not end
/// the session; [`WsConnector`] ends its stream right after yielding one.
pub struct Transport {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Transport {
    pub fn new<S, R>(sink: S, stream: R) -> Self
    where
        S: Sink<String, Error = ChannelError> + Send + 'static,
        R: Stream<Item = Result<String, ChannelError>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

/// Opens transports for a [`crate::channel::ChannelClient`].
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Transport, ChannelError>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Transport, ChannelError>> {
        let url = url.to_owned();
        Box::pin(async move {
            let (ws_stream, _) = connect_async(url.as_str()).await?;
            let (write, read) = ws_stream.split();

            let sink = write.sink_map_err(ChannelError::from).with(|text: String| {
                future::ready(Ok::<_, ChannelError>(Message::Text(text.into())))
            });

            let frames = stream::unfold((read, false), |(mut read, failed)| async move {
                if failed {
                    return None;
                }
                loop {
                    match read.next().await? {
                        Ok(Message::Text(text)) => {
                            return Some((Ok(text.as_str().to_owned()), (read, false)));
                        }
                        Ok(Message::Close(_)) => return None,
                        Ok(_) => continue,
                        Err(tungstenite::Error::ConnectionClosed)
                        | Err(tungstenite::Error::AlreadyClosed) => return None,
                        Err(err) => return Some((Err(ChannelError::from(err)), (read, true))),
                    }
                }
            });

            Ok(Transport::new(sink, frames))
        })
    }
}

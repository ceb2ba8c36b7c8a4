//! # Streaming Recognition Client
//!
//! Sends one utterance to the upstream recognition backend over a WebSocket
//! using the binary frame protocol in `protocol.rs`.
//!
//! ## Exchange:
//! 1. Connect with a bearer token
//! 2. Send the session configuration (full client request, sequence 1, gzip JSON)
//! 3. Wait for the backend to acknowledge it
//! 4. Stream the audio as audio-only frames; the last one carries a negative sequence
//! 5. Read responses until the backend's last packet (or close), keeping the best transcript
//!
//! Malformed frames are logged and skipped; only a transport failure or a
//! server-error frame ends the attempt early.

use super::protocol::{self, FrameSequencer, MessageType};
use crate::audio::processor;
use crate::config::{AsrConfig, AudioConfig};
use crate::services::retry::{with_retry, RetryPolicy};
use crate::services::{BackendError, Transcriber};
use async_trait::async_trait;
use futures_util::{SinkExt, Stream, StreamExt};
use serde::Serialize;
use tokio_tungstenite::connect_async_with_config;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

/// Container the audio is sent in. Tried in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioEncoding {
    Pcm,
    Wav,
}

impl AudioEncoding {
    pub const GUESSES: [AudioEncoding; 2] = [AudioEncoding::Pcm, AudioEncoding::Wav];

    fn as_str(self) -> &'static str {
        match self {
            AudioEncoding::Pcm => "pcm",
            AudioEncoding::Wav => "wav",
        }
    }
}

#[derive(Debug, Serialize)]
struct SessionRequest<'a> {
    user: UserSection<'a>,
    audio: AudioSection,
    request: RequestSection<'a>,
}

#[derive(Debug, Serialize)]
struct UserSection<'a> {
    uid: &'a str,
}

#[derive(Debug, Serialize)]
struct AudioSection {
    format: &'static str,
    sample_rate: u32,
    bits: u16,
    channel: u16,
    codec: &'static str,
}

#[derive(Debug, Serialize)]
struct RequestSection<'a> {
    model_name: &'a str,
    enable_punc: bool,
}

pub struct StreamingAsrClient {
    config: AsrConfig,
    audio: AudioConfig,
    policy: RetryPolicy,
}

impl StreamingAsrClient {
    pub fn new(config: AsrConfig, audio: AudioConfig) -> Self {
        let policy = RetryPolicy::from(&config.backend);
        Self { config, audio, policy }
    }

    fn session_request(&self, encoding: AudioEncoding) -> SessionRequest<'_> {
        SessionRequest {
            user: UserSection { uid: &self.config.uid },
            audio: AudioSection {
                format: encoding.as_str(),
                sample_rate: self.audio.sample_rate,
                bits: self.audio.bit_depth,
                channel: self.audio.channels,
                codec: "raw",
            },
            request: RequestSection {
                model_name: &self.config.model_name,
                enable_punc: true,
            },
        }
    }

    /// One connection, one utterance.
    async fn recognize_once(&self, encoding: AudioEncoding, audio: &[u8]) -> Result<String, BackendError> {
        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        request.headers_mut().insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {}", self.config.api_key))
                .map_err(|e| BackendError::Transport(e.to_string()))?,
        );

        let (stream, _response) = connect_async_with_config(request, None, true)
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        let (mut write, mut read) = stream.split();
        let mut frames = FrameSequencer::new();
        let codec_err = |e: protocol::CodecError| BackendError::Protocol(e.to_string());

        let config_frame = frames
            .full_request(&self.session_request(encoding))
            .map_err(codec_err)?;
        write
            .send(Message::Binary(config_frame))
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        await_ack(&mut read).await?;

        let chunk_count = audio.len().div_ceil(self.config.chunk_bytes);
        for (index, chunk) in audio.chunks(self.config.chunk_bytes).enumerate() {
            let frame = frames.audio(chunk, index + 1 == chunk_count).map_err(codec_err)?;
            write
                .send(Message::Binary(frame))
                .await
                .map_err(|e| BackendError::Transport(e.to_string()))?;
        }
        debug!(encoding = encoding.as_str(), frames = chunk_count, "audio streamed");

        let transcript = collect_transcript(&mut read).await;
        if let Err(e) = write.close().await {
            debug!(error = %e, "recognition connection did not close cleanly");
        }
        transcript
    }
}

/// Wait for the backend to accept the session configuration.
async fn await_ack<S>(read: &mut S) -> Result<(), BackendError>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(message) = read.next().await {
        match message {
            Ok(Message::Binary(bytes)) => match protocol::decode(&bytes) {
                Ok(frame) if frame.message_type == MessageType::ServerError => {
                    return Err(BackendError::Protocol(frame.error_message()));
                }
                Ok(_) => return Ok(()),
                Err(e) => warn!(error = %e, "dropping malformed recognition frame"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => return Err(BackendError::Transport(e.to_string())),
        }
    }
    Err(BackendError::Transport(
        "recognition backend closed before accepting the session".to_string(),
    ))
}

/// Read responses until the backend's last packet, keeping the best transcript.
///
/// Partial results grow as more audio is recognised; the final packet's text
/// wins when it has any.
async fn collect_transcript<S>(read: &mut S) -> Result<String, BackendError>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let mut transcript = String::new();
    while let Some(message) = read.next().await {
        let bytes = match message {
            Ok(Message::Binary(bytes)) => bytes,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => return Err(BackendError::Transport(e.to_string())),
        };

        let frame = match protocol::decode(&bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "dropping malformed recognition frame");
                continue;
            }
        };
        if frame.message_type == MessageType::ServerError {
            return Err(BackendError::Protocol(frame.error_message()));
        }

        match frame.transcript() {
            Ok(text) if frame.is_last() && !text.is_empty() => transcript = text,
            Ok(text) if text.len() > transcript.len() => {
                debug!(chars = text.chars().count(), "partial transcript");
                transcript = text;
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "dropping undecodable recognition payload"),
        }

        if frame.is_last() {
            break;
        }
    }
    Ok(transcript)
}

#[async_trait]
impl Transcriber for StreamingAsrClient {
    async fn transcribe(&self, audio: &[u8]) -> Result<String, BackendError> {
        if audio.is_empty() {
            return Ok(String::new());
        }
        if self.config.api_key.is_empty() {
            return Err(BackendError::NotConfigured("asr"));
        }

        let mut last_error = BackendError::Transport("no audio format attempted".to_string());
        for encoding in AudioEncoding::GUESSES {
            let payload = match encoding {
                AudioEncoding::Pcm => audio.to_vec(),
                AudioEncoding::Wav => processor::pcm_to_wav(audio, &self.audio)
                    .map_err(|e| BackendError::Protocol(format!("failed to build WAV: {}", e)))?,
            };

            match with_retry("asr", &self.policy, || self.recognize_once(encoding, &payload)).await {
                Ok(text) => {
                    info!(
                        encoding = encoding.as_str(),
                        bytes = audio.len(),
                        chars = text.chars().count(),
                        "transcription complete"
                    );
                    return Ok(text);
                }
                Err(e) => {
                    warn!(encoding = encoding.as_str(), error = %e, "transcription failed for format");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::transcription::protocol::{decode, encode_json};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    fn client_for(url: String) -> StreamingAsrClient {
        let defaults = AppConfig::default();
        let mut config = defaults.asr;
        config.url = url;
        config.api_key = "test-key".to_string();
        config.chunk_bytes = 1000;
        config.backend.attempts = 1;
        config.backend.timeout_secs = 5;
        config.backend.retry_delay_ms = 1;
        StreamingAsrClient::new(config, defaults.audio)
    }

    /// A one-connection backend that acknowledges the session, records the
    /// sequence numbers it receives and answers with a partial, a garbage
    /// frame and a final result.
    async fn fake_backend(final_text: &'static str) -> (String, JoinHandle<(Vec<i32>, Value)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let mut sequences = Vec::new();

            let first = decode(&ws.next().await.unwrap().unwrap().into_data()).unwrap();
            assert_eq!(first.message_type, MessageType::FullClientRequest);
            sequences.push(first.sequence.unwrap());
            let session: Value = serde_json::from_slice(&first.payload).unwrap();

            let ack = encode_json(MessageType::FullServerResponse, Some(1), &json!({"code": 1000}), true).unwrap();
            ws.send(Message::Binary(ack)).await.unwrap();

            loop {
                let frame = decode(&ws.next().await.unwrap().unwrap().into_data()).unwrap();
                assert_eq!(frame.message_type, MessageType::AudioOnlyRequest);
                sequences.push(frame.sequence.unwrap());
                if frame.is_last() {
                    break;
                }
            }

            let partial = encode_json(
                MessageType::FullServerResponse,
                Some(2),
                &json!({"payload_msg": {"result": {"text": "hel"}}}),
                true,
            )
            .unwrap();
            ws.send(Message::Binary(partial)).await.unwrap();
            ws.send(Message::Binary(vec![0x11, 0x90])).await.unwrap();
            let last = encode_json(
                MessageType::FullServerResponse,
                Some(-3),
                &json!({"result": {"text": final_text}}),
                true,
            )
            .unwrap();
            ws.send(Message::Binary(last)).await.unwrap();
            (sequences, session)
        });

        (url, handle)
    }

    #[tokio::test]
    async fn test_transcribes_over_wire_protocol() {
        let (url, backend) = fake_backend("hello there").await;
        let client = client_for(url);

        let text = client.transcribe(&vec![0u8; 2500]).await.unwrap();
        assert_eq!(text, "hello there");

        let (sequences, session) = backend.await.unwrap();
        assert_eq!(sequences, vec![1, 2, 3, -4]);
        assert_eq!(session["audio"]["format"], "pcm");
        assert_eq!(session["audio"]["sample_rate"], 16000);
        assert_eq!(session["request"]["enable_punc"], true);
    }

    #[tokio::test]
    async fn test_server_error_tries_next_format_then_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let backend = tokio::spawn(async move {
            let mut formats = Vec::new();
            for _ in 0..2 {
                let (tcp, _) = listener.accept().await.unwrap();
                let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
                let first = decode(&ws.next().await.unwrap().unwrap().into_data()).unwrap();
                let session: Value = serde_json::from_slice(&first.payload).unwrap();
                formats.push(session["audio"]["format"].as_str().unwrap_or_default().to_string());
                let err = encode_json(MessageType::ServerError, None, &json!({"message": "bad audio"}), false).unwrap();
                ws.send(Message::Binary(err)).await.unwrap();
            }
            formats
        });

        let client = client_for(url);
        let result = tokio::time::timeout(Duration::from_secs(10), client.transcribe(&[1u8; 64]))
            .await
            .unwrap();
        assert_eq!(result, Err(BackendError::Protocol("bad audio".to_string())));
        assert_eq!(backend.await.unwrap(), vec!["pcm".to_string(), "wav".to_string()]);
    }

    #[tokio::test]
    async fn test_last_flag_without_sequence_ends_the_utterance() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let backend = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            ws.next().await.unwrap().unwrap();
            let ack = encode_json(MessageType::FullServerResponse, Some(1), &json!({"code": 1000}), false).unwrap();
            ws.send(Message::Binary(ack)).await.unwrap();
            loop {
                let frame = decode(&ws.next().await.unwrap().unwrap().into_data()).unwrap();
                if frame.is_last() {
                    break;
                }
            }

            let payload = br#"{"result":{"text":"final words"}}"#;
            let mut last = vec![0x11, 0x92, 0x10, 0x00];
            last.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            last.extend_from_slice(payload);
            ws.send(Message::Binary(last)).await.unwrap();
            // Keep the socket open so only the last flag can end the read loop
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let client = client_for(url);
        let text = tokio::time::timeout(Duration::from_secs(3), client.transcribe(&[0u8; 1500]))
            .await
            .unwrap();
        assert_eq!(text, Ok("final words".to_string()));
        backend.abort();
    }

    #[tokio::test]
    async fn test_empty_audio_is_no_speech() {
        let client = client_for("ws://127.0.0.1:9".to_string());
        assert_eq!(client.transcribe(&[]).await, Ok(String::new()));
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);
        let result = client_for(url).transcribe(&[1u8; 64]).await;
        assert!(matches!(result, Err(BackendError::Transport(_))));
    }
}

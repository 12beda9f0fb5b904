//! Pull-based text streaming contract shared by the DVM and local models.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::Stream;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, mpsc};

use crate::error::{DvmError, Result};

// ============================================================================
// Chunks and prompts
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    /// Model output.
    Text,
    /// Status for the user, e.g. a payment notice.
    Info,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub kind: ChunkKind,
    pub text: String,
}

impl StreamChunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: ChunkKind::Text,
            text: text.into(),
        }
    }

    pub fn info(text: impl Into<String>) -> Self {
        Self {
            kind: ChunkKind::Info,
            text: text.into(),
        }
    }

    pub fn is_text(&self) -> bool {
        self.kind == ChunkKind::Text
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Prompt {
    Text(String),
    Chat(Vec<ChatMessage>),
}

impl Prompt {
    /// Chat history becomes one `role: content` line per message.
    pub fn to_text(&self) -> String {
        match self {
            Prompt::Text(text) => text.clone(),
            Prompt::Chat(messages) => messages
                .iter()
                .map(|m| format!("{}: {}", m.role, m.content))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Prompt::Text(text) => text.trim().is_empty(),
            Prompt::Chat(messages) => messages.iter().all(|m| m.content.trim().is_empty()),
        }
    }
}

impl From<&str> for Prompt {
    fn from(text: &str) -> Self {
        Prompt::Text(text.to_string())
    }
}

impl From<String> for Prompt {
    fn from(text: String) -> Self {
        Prompt::Text(text)
    }
}

impl From<Vec<ChatMessage>> for Prompt {
    fn from(messages: Vec<ChatMessage>) -> Self {
        Prompt::Chat(messages)
    }
}

/// Per-call overrides. Unset fields fall back to the model's configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamOptions {
    pub model: Option<String>,
    /// Job request kind for DVM models.
    pub kind: Option<u16>,
    /// Extra `param` tags.
    pub params: Vec<(String, String)>,
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
}

impl StreamOptions {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Anything that can turn a prompt into a stream of text.
pub trait LanguageModel: Send + Sync {
    fn id(&self) -> &str;

    /// Returns immediately; no work starts until the stream is first polled.
    fn stream_text(&self, prompt: Prompt, options: StreamOptions) -> Result<TextStream>;
}

pub(crate) fn validate_prompt(prompt: &Prompt) -> Result<()> {
    if prompt.is_empty() {
        return Err(DvmError::Validation("prompt is empty".to_string()));
    }
    Ok(())
}

// ============================================================================
// Cancellation
// ============================================================================

type CancelHook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
    hooks: Mutex<Vec<CancelHook>>,
}

/// Cloneable cancel switch for a [`TextStream`].
#[derive(Clone, Default)]
pub struct StreamCanceller {
    state: Arc<CancelState>,
}

impl fmt::Debug for StreamCanceller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamCanceller")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl StreamCanceller {
    /// Returns `true` only for the call that actually cancelled.
    pub fn cancel(&self) -> bool {
        if self.state.cancelled.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.state.notify.notify_waiters();
        let hooks = std::mem::take(
            &mut *self.state.hooks.lock().unwrap_or_else(|e| e.into_inner()),
        );
        for hook in hooks {
            hook();
        }
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        loop {
            let notified = self.state.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Run `hook` on cancel, or right away if already cancelled.
    pub fn on_cancel(&self, hook: impl FnOnce() + Send + 'static) {
        let mut hooks = self.state.hooks.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_cancelled() {
            drop(hooks);
            hook();
        } else {
            hooks.push(Box::new(hook));
        }
    }
}

// ============================================================================
// TextStream
// ============================================================================

/// Sending half handed to producers.
pub type ChunkSender = mpsc::Sender<Result<StreamChunk>>;

type Producer = Box<dyn FnOnce(ChunkSender, StreamCanceller) -> BoxFuture<'static, ()> + Send>;

/// Ordered, cancellable stream of chunks.
///
/// The producer is spawned on the first poll. An `Err` item is always the
/// last one. After [`TextStream::cancel`] the stream yields `None`, and
/// dropping the stream cancels it.
pub struct TextStream {
    producer: Option<Producer>,
    rx: Option<mpsc::Receiver<Result<StreamChunk>>>,
    buffer: usize,
    canceller: StreamCanceller,
    done: bool,
}

impl fmt::Debug for TextStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TextStream")
            .field("started", &self.producer.is_none())
            .field("done", &self.done)
            .field("canceller", &self.canceller)
            .finish()
    }
}

impl TextStream {
    pub fn lazy<F, Fut>(buffer: usize, producer: F) -> Self
    where
        F: FnOnce(ChunkSender, StreamCanceller) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            producer: Some(Box::new(
                move |tx: ChunkSender, canceller: StreamCanceller| -> BoxFuture<'static, ()> {
                    Box::pin(producer(tx, canceller))
                },
            )),
            rx: None,
            buffer: buffer.max(1),
            canceller: StreamCanceller::default(),
            done: false,
        }
    }

    /// Stream that ends right away with `err`.
    pub fn failed(err: DvmError) -> Self {
        Self::lazy(1, move |tx, _| async move {
            let _ = tx.send(Err(err)).await;
        })
    }

    pub fn cancel(&self) -> bool {
        self.canceller.cancel()
    }

    pub fn is_cancelled(&self) -> bool {
        self.canceller.is_cancelled()
    }

    pub fn canceller(&self) -> StreamCanceller {
        self.canceller.clone()
    }

    /// Whether the producer has been started.
    pub fn is_started(&self) -> bool {
        self.producer.is_none()
    }

    pub async fn next_chunk(&mut self) -> Option<Result<StreamChunk>> {
        futures::StreamExt::next(self).await
    }

    /// Drain the stream, concatenating text chunks. Info chunks are skipped.
    pub async fn collect_text(mut self) -> Result<String> {
        let mut text = String::new();
        while let Some(chunk) = self.next_chunk().await {
            let chunk = chunk?;
            if chunk.is_text() {
                text.push_str(&chunk.text);
            }
        }
        Ok(text)
    }

    /// Drain the stream into its chunks.
    pub async fn collect_chunks(mut self) -> Result<Vec<StreamChunk>> {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.next_chunk().await {
            chunks.push(chunk?);
        }
        Ok(chunks)
    }
}

impl Stream for TextStream {
    type Item = Result<StreamChunk>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.done || this.canceller.is_cancelled() {
            return Poll::Ready(None);
        }

        if let Some(producer) = this.producer.take() {
            let (tx, rx) = mpsc::channel(this.buffer);
            tokio::spawn(producer(tx, this.canceller.clone()));
            this.rx = Some(rx);
        }

        let Some(rx) = this.rx.as_mut() else {
            this.done = true;
            return Poll::Ready(None);
        };

        match rx.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(_)) if this.canceller.is_cancelled() => {
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(err))) => {
                this.done = true;
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(chunk))),
        }
    }
}

impl Drop for TextStream {
    fn drop(&mut self) {
        self.canceller.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_stream(started: Arc<AtomicBool>, chunks: Vec<&'static str>) -> TextStream {
        TextStream::lazy(4, move |tx, _| async move {
            started.store(true, Ordering::SeqCst);
            for chunk in chunks {
                if tx.send(Ok(StreamChunk::text(chunk))).await.is_err() {
                    return;
                }
            }
        })
    }

    #[test]
    fn test_chat_prompt_flattening() {
        let prompt = Prompt::Chat(vec![
            ChatMessage::system("be brief"),
            ChatMessage::user("hi"),
        ]);
        assert_eq!(prompt.to_text(), "system: be brief\nuser: hi");
        assert!(!prompt.is_empty());
        assert!(Prompt::from("  ").is_empty());
        assert!(Prompt::Chat(vec![]).is_empty());
    }

    #[tokio::test]
    async fn test_lazy_until_first_poll() {
        let started = Arc::new(AtomicBool::new(false));
        let mut stream = counting_stream(started.clone(), vec!["a", "b"]);
        tokio::task::yield_now().await;
        assert!(!started.load(Ordering::SeqCst));
        assert!(!stream.is_started());

        let first = stream.next_chunk().await.unwrap().unwrap();
        assert_eq!(first, StreamChunk::text("a"));
        assert!(started.load(Ordering::SeqCst));
        assert_eq!(stream.collect_text().await.unwrap(), "b");
    }

    #[tokio::test]
    async fn test_error_is_last_item() {
        let mut stream = TextStream::lazy(4, |tx, _| async move {
            let _ = tx.send(Ok(StreamChunk::text("partial"))).await;
            let _ = tx.send(Err(DvmError::Network("gone".to_string()))).await;
            let _ = tx.send(Ok(StreamChunk::text("never"))).await;
        });
        assert!(stream.next_chunk().await.unwrap().is_ok());
        assert_eq!(
            stream.next_chunk().await.unwrap(),
            Err(DvmError::Network("gone".to_string()))
        );
        assert!(stream.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_ends_stream_and_runs_hooks_once() {
        let hook_runs = Arc::new(AtomicUsize::new(0));
        let runs = hook_runs.clone();
        let mut stream = TextStream::lazy(4, move |tx, canceller| async move {
            let runs = runs.clone();
            canceller.on_cancel(move || {
                runs.fetch_add(1, Ordering::SeqCst);
            });
            let _ = tx.send(Ok(StreamChunk::text("first"))).await;
            canceller.cancelled().await;
        });

        assert!(stream.next_chunk().await.is_some());
        assert!(stream.cancel());
        assert!(!stream.cancel());
        assert!(stream.next_chunk().await.is_none());
        drop(stream);
        assert_eq!(hook_runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_hook_after_cancel_runs_immediately() {
        let canceller = StreamCanceller::default();
        canceller.cancel();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        canceller.on_cancel(move || flag.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_drop_cancels_producer() {
        let stream = TextStream::lazy(1, |tx, canceller| async move {
            let _ = tx.send(Ok(StreamChunk::text("x"))).await;
            canceller.cancelled().await;
        });
        let canceller = stream.canceller();
        drop(stream);
        assert!(canceller.is_cancelled());
    }

    #[tokio::test]
    async fn test_failed_stream() {
        let stream = TextStream::failed(DvmError::Validation("bad".to_string()));
        assert_eq!(
            stream.collect_text().await,
            Err(DvmError::Validation("bad".to_string()))
        );
    }
}

//! [`LanguageModel`] over an in-process [`InferenceBackend`].

use std::sync::Arc;

use tracing::debug;

use crate::backend::{BackendError, CompletionRequest, InferenceBackend};
use crate::error::{DvmError, Result};
use crate::stream::{
    LanguageModel, Prompt, StreamChunk, StreamOptions, TextStream, validate_prompt,
};

pub struct LocalLanguageModel<B: InferenceBackend> {
    backend: Arc<B>,
    default_model: String,
    buffer: usize,
}

impl<B: InferenceBackend + 'static> LocalLanguageModel<B> {
    pub fn new(backend: Arc<B>, default_model: impl Into<String>) -> Self {
        Self {
            backend,
            default_model: default_model.into(),
            buffer: 64,
        }
    }

    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    fn completion_request(&self, prompt: &Prompt, options: &StreamOptions) -> CompletionRequest {
        let model = options
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());
        let mut request = CompletionRequest::new(model, prompt.to_text()).streaming();
        for (name, value) in &options.params {
            request.apply_param(name, value);
        }
        if let Some(max_tokens) = options.max_tokens {
            request.max_tokens = Some(max_tokens);
        }
        if let Some(temperature) = options.temperature {
            request.temperature = Some(temperature);
        }
        request
    }
}

impl<B: InferenceBackend + 'static> LanguageModel for LocalLanguageModel<B> {
    fn id(&self) -> &str {
        self.backend.id()
    }

    fn stream_text(&self, prompt: Prompt, options: StreamOptions) -> Result<TextStream> {
        validate_prompt(&prompt)?;
        let request = self.completion_request(&prompt, &options);
        let backend = self.backend.clone();

        Ok(TextStream::lazy(self.buffer, move |tx, canceller| async move {
            if !backend.is_ready().await {
                let err = BackendError::Unavailable(backend.id().to_string());
                let _ = tx.send(Err(DvmError::from(err))).await;
                return;
            }
            debug!(backend = backend.id(), model = %request.model, "starting local stream");
            let mut chunks = match backend.complete_stream(request).await {
                Ok(rx) => rx,
                Err(err) => {
                    let _ = tx.send(Err(DvmError::from(err))).await;
                    return;
                }
            };

            loop {
                let next = tokio::select! {
                    biased;
                    _ = canceller.cancelled() => None,
                    next = chunks.recv() => next,
                };
                match next {
                    Some(Ok(chunk)) => {
                        if chunk.delta.is_empty() {
                            continue;
                        }
                        if tx.send(Ok(StreamChunk::text(chunk.delta))).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        let _ = tx.send(Err(DvmError::from(err))).await;
                        break;
                    }
                    None => break,
                }
            }
            // dropping `chunks` tells the backend to stop
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendChunk;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;

    struct ScriptedBackend {
        deltas: Vec<&'static str>,
        fail_after: Option<usize>,
        ready: AtomicBool,
        seen: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedBackend {
        fn new(deltas: Vec<&'static str>) -> Self {
            Self {
                deltas,
                fail_after: None,
                ready: AtomicBool::new(true),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl InferenceBackend for ScriptedBackend {
        fn id(&self) -> &str {
            "scripted"
        }

        async fn is_ready(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }

        async fn complete_stream(
            &self,
            request: CompletionRequest,
        ) -> crate::backend::Result<mpsc::Receiver<crate::backend::Result<BackendChunk>>> {
            self.seen.lock().unwrap().push(request.clone());
            let (tx, rx) = mpsc::channel(16);
            let deltas = self.deltas.clone();
            let fail_after = self.fail_after;
            tokio::spawn(async move {
                for (i, delta) in deltas.into_iter().enumerate() {
                    if fail_after == Some(i) {
                        let _ = tx
                            .send(Err(BackendError::StreamError("lost".to_string())))
                            .await;
                        return;
                    }
                    let chunk = BackendChunk {
                        id: i.to_string(),
                        model: request.model.clone(),
                        delta: delta.to_string(),
                        finish_reason: None,
                    };
                    if tx.send(Ok(chunk)).await.is_err() {
                        return;
                    }
                }
            });
            Ok(rx)
        }
    }

    #[tokio::test]
    async fn test_streams_backend_chunks_in_order() {
        let backend = Arc::new(ScriptedBackend::new(vec!["Hel", "", "lo"]));
        let model = LocalLanguageModel::new(backend.clone(), "llama3.2");

        let options = StreamOptions::default()
            .with_param("temperature", "0.2")
            .with_max_tokens(32);
        let stream = model.stream_text("hello".into(), options).unwrap();
        assert!(!stream.is_started());

        let chunks = stream.collect_chunks().await.unwrap();
        assert_eq!(chunks, vec![StreamChunk::text("Hel"), StreamChunk::text("lo")]);

        let seen = backend.seen.lock().unwrap();
        assert_eq!(seen[0].model, "llama3.2");
        assert_eq!(seen[0].temperature, Some(0.2));
        assert_eq!(seen[0].max_tokens, Some(32));
        assert!(seen[0].stream);
    }

    #[tokio::test]
    async fn test_backend_error_ends_stream() {
        let mut backend = ScriptedBackend::new(vec!["a", "b", "c"]);
        backend.fail_after = Some(1);
        let model = LocalLanguageModel::new(Arc::new(backend), "m");

        let mut stream = model.stream_text("x".into(), StreamOptions::default()).unwrap();
        assert_eq!(stream.next_chunk().await, Some(Ok(StreamChunk::text("a"))));
        assert!(matches!(
            stream.next_chunk().await,
            Some(Err(DvmError::Backend(_)))
        ));
        assert!(stream.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn test_unready_backend_is_not_asked_to_stream() {
        let backend = Arc::new(ScriptedBackend::new(vec!["a"]));
        backend.ready.store(false, Ordering::SeqCst);
        let model = LocalLanguageModel::new(backend.clone(), "m");

        let mut stream = model.stream_text("x".into(), StreamOptions::default()).unwrap();
        assert_eq!(
            stream.next_chunk().await,
            Some(Err(DvmError::Backend(
                "Backend unavailable: scripted".to_string()
            )))
        );
        assert!(stream.next_chunk().await.is_none());
        assert!(backend.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_stops_local_stream() {
        let model = LocalLanguageModel::new(
            Arc::new(ScriptedBackend::new(vec!["a", "b", "c", "d"])),
            "m",
        )
        .with_buffer(1);
        let mut stream = model.stream_text("x".into(), StreamOptions::default()).unwrap();
        assert!(stream.next_chunk().await.is_some());
        stream.cancel();
        assert!(stream.next_chunk().await.is_none());
    }

    #[test]
    fn test_empty_prompt_rejected() {
        let model = LocalLanguageModel::new(Arc::new(ScriptedBackend::new(vec![])), "m");
        assert!(matches!(
            model.stream_text(" ".into(), StreamOptions::default()),
            Err(DvmError::Validation(_))
        ));
    }
}

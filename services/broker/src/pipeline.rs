//! Typed message pipes.
//!
//! The fan-out composes per-session plumbing from three concrete pipe
//! shapes, each a task over bounded channels:
//!
//! - [`Versatile`]: one input stream, one output stream, a fallible
//!   transform in between. Transform failures go to the pipe's error
//!   stream and the offending item is dropped.
//! - [`Selector`]: one input stream routed to the first matching case's
//!   output stream. Items matching no case are dropped with a warning.
//! - [`Merge`]: several input streams interleaved into one output stream,
//!   closing when every input has closed.
//!
//! Input and output types are explicit on every pipe, so a mis-wired
//! pipeline fails to compile instead of failing a downcast at runtime.
//! A pipe ends when its input closes; dropping the upstream sender tears
//! the whole pipeline down in order.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One-in one-out transform pipe.
pub struct Versatile<I, O, E> {
    transform: Box<dyn FnMut(I) -> Result<O, E> + Send>,
}

impl<I, O, E> Versatile<I, O, E>
where
    I: Send + 'static,
    O: Send + 'static,
    E: Send + 'static,
{
    pub fn new(transform: impl FnMut(I) -> Result<O, E> + Send + 'static) -> Self {
        Self {
            transform: Box::new(transform),
        }
    }

    fn spawn(
        mut self,
        mut input: mpsc::Receiver<I>,
        output: mpsc::Sender<O>,
        errors: mpsc::Sender<E>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(item) = input.recv().await {
                match (self.transform)(item) {
                    Ok(out) => {
                        if output.send(out).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        if errors.send(err).await.is_err() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

/// One routing case: a predicate and the stream taking matching items.
pub struct Case<T> {
    name: &'static str,
    matches: Box<dyn Fn(&T) -> bool + Send + Sync>,
    output: mpsc::Sender<T>,
}

/// One-in many-out routing pipe.
pub struct Selector<T> {
    cases: Vec<Case<T>>,
}

impl<T> Selector<T>
where
    T: Send + std::fmt::Debug + 'static,
{
    pub fn new() -> Self {
        Self { cases: Vec::new() }
    }

    pub fn case(
        mut self,
        name: &'static str,
        matches: impl Fn(&T) -> bool + Send + Sync + 'static,
        output: mpsc::Sender<T>,
    ) -> Self {
        self.cases.push(Case {
            name,
            matches: Box::new(matches),
            output,
        });
        self
    }

    fn spawn(self, mut input: mpsc::Receiver<T>) -> JoinHandle<()> {
        tokio::spawn(async move {
            'next: while let Some(item) = input.recv().await {
                for case in &self.cases {
                    if (case.matches)(&item) {
                        if case.output.send(item).await.is_err() {
                            tracing::debug!(case = case.name, "selector output closed");
                            break 'next;
                        }
                        continue 'next;
                    }
                }
                tracing::warn!(?item, "dropping item matching no selector case");
            }
        })
    }
}

impl<T> Default for Selector<T>
where
    T: Send + std::fmt::Debug + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Many-in one-out interleaving pipe.
pub struct Merge;

impl Merge {
    fn spawn<T: Send + 'static>(
        inputs: Vec<mpsc::Receiver<T>>,
        output: mpsc::Sender<T>,
    ) -> Vec<JoinHandle<()>> {
        inputs
            .into_iter()
            .map(|mut input| {
                let output = output.clone();
                tokio::spawn(async move {
                    while let Some(item) = input.recv().await {
                        if output.send(item).await.is_err() {
                            break;
                        }
                    }
                })
            })
            .collect()
    }
}

/// Connects pipes and owns their tasks.
#[derive(Default)]
pub struct PipelineBuilder {
    tasks: Vec<JoinHandle<()>>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn versatile<I, O, E>(
        mut self,
        pipe: Versatile<I, O, E>,
        input: mpsc::Receiver<I>,
        output: mpsc::Sender<O>,
        errors: mpsc::Sender<E>,
    ) -> Self
    where
        I: Send + 'static,
        O: Send + 'static,
        E: Send + 'static,
    {
        self.tasks.push(pipe.spawn(input, output, errors));
        self
    }

    pub fn selector<T>(mut self, pipe: Selector<T>, input: mpsc::Receiver<T>) -> Self
    where
        T: Send + std::fmt::Debug + 'static,
    {
        self.tasks.push(pipe.spawn(input));
        self
    }

    pub fn merge<T: Send + 'static>(
        mut self,
        inputs: Vec<mpsc::Receiver<T>>,
        output: mpsc::Sender<T>,
    ) -> Self {
        self.tasks.extend(Merge::spawn(inputs, output));
        self
    }

    pub fn build(self) -> Pipeline {
        Pipeline { tasks: self.tasks }
    }
}

/// Handle over the running pipe tasks.
pub struct Pipeline {
    tasks: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Wait for every pipe to drain. Pipes end when their inputs close.
    pub async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }

    pub fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn versatile_transforms_and_reports_errors() {
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let (err_tx, mut err_rx) = mpsc::channel(4);
        let pipeline = PipelineBuilder::new()
            .versatile(
                Versatile::new(|value: u32| {
                    if value % 2 == 0 {
                        Ok(value * 10)
                    } else {
                        Err(value)
                    }
                }),
                in_rx,
                out_tx,
                err_tx,
            )
            .build();

        for value in [2u32, 3, 4] {
            in_tx.send(value).await.expect("send");
        }
        drop(in_tx);

        assert_eq!(out_rx.recv().await, Some(20));
        assert_eq!(out_rx.recv().await, Some(40));
        assert_eq!(err_rx.recv().await, Some(3));
        pipeline.join().await;
        assert_eq!(out_rx.recv().await, None);
    }

    #[tokio::test]
    async fn selector_routes_to_first_matching_case() {
        let (in_tx, in_rx) = mpsc::channel(4);
        let (small_tx, mut small_rx) = mpsc::channel(4);
        let (large_tx, mut large_rx) = mpsc::channel(4);
        let pipeline = PipelineBuilder::new()
            .selector(
                Selector::new()
                    .case("small", |value: &u32| *value < 10, small_tx)
                    .case("large", |value: &u32| *value >= 10, large_tx),
                in_rx,
            )
            .build();

        in_tx.send(3).await.expect("send");
        in_tx.send(30).await.expect("send");
        drop(in_tx);

        assert_eq!(small_rx.recv().await, Some(3));
        assert_eq!(large_rx.recv().await, Some(30));
        pipeline.join().await;
        assert_eq!(small_rx.recv().await, None);
        assert_eq!(large_rx.recv().await, None);
    }

    #[tokio::test]
    async fn selector_drops_unmatched_items() {
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let pipeline = PipelineBuilder::new()
            .selector(
                Selector::new().case("even", |value: &u32| *value % 2 == 0, out_tx),
                in_rx,
            )
            .build();

        in_tx.send(1).await.expect("send");
        in_tx.send(2).await.expect("send");
        drop(in_tx);
        pipeline.join().await;

        assert_eq!(out_rx.recv().await, Some(2));
        assert_eq!(out_rx.recv().await, None);
    }

    #[tokio::test]
    async fn merge_interleaves_until_all_inputs_close() {
        let (a_tx, a_rx) = mpsc::channel(4);
        let (b_tx, b_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let pipeline = PipelineBuilder::new().merge(vec![a_rx, b_rx], out_tx).build();

        a_tx.send("a").await.expect("send");
        b_tx.send("b").await.expect("send");
        drop(a_tx);

        let mut seen = vec![out_rx.recv().await.expect("item")];
        b_tx.send("b2").await.expect("send");
        drop(b_tx);
        while let Some(item) = out_rx.recv().await {
            seen.push(item);
        }
        pipeline.join().await;
        seen.sort();
        assert_eq!(seen, vec!["a", "b", "b2"]);
    }
}

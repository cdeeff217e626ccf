use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Sender};

use crate::error::{Result, UnionError};

const WKQ_DEPTH: usize = 64;
const WKQ_RETRIES: usize = 3;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct Wkq {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl Wkq {
    pub fn new(nworkers: usize) -> Result<Self> {
        let (tx, rx) = bounded::<Job>(WKQ_DEPTH);
        let mut workers = Vec::new();
        for i in 0..nworkers.max(1) {
            let rx = rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("unionfs-wkq-{}", i))
                .spawn(move || {
                    for job in rx.iter() {
                        job();
                    }
                })?;
            workers.push(handle);
        }
        Ok(Self {
            tx: Some(tx),
            workers,
        })
    }

    /// Run `op` on a worker and wait for its result. Interrupted attempts are
    /// retried a bounded number of times.
    pub fn run_with_retry<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn() -> Result<T> + Send + 'static,
    {
        let tx = self.tx.as_ref().ok_or(UnionError::QueueClosed)?;
        let (rtx, rrx) = bounded(1);
        tx.send(Box::new(move || {
            let mut attempt = 0;
            let result = loop {
                match op() {
                    Err(UnionError::Io(e))
                        if e.kind() == std::io::ErrorKind::Interrupted
                            && attempt < WKQ_RETRIES =>
                    {
                        attempt += 1;
                        log::debug!("wkq job interrupted, retry {}", attempt);
                    }
                    other => break other,
                }
            };
            let _ = rtx.send(result);
        }))
        .map_err(|_| UnionError::QueueClosed)?;
        rrx.recv().map_err(|_| UnionError::QueueClosed)?
    }
}

impl Drop for Wkq {
    fn drop(&mut self) {
        self.tx.take();
        for w in self.workers.drain(..) {
            if w.join().is_err() {
                log::error!("wkq worker panicked");
            }
        }
    }
}

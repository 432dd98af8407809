use std::{
    sync::{Arc, Mutex, mpsc},
    thread,
};

use log::{debug, error};

use crate::error::{DtpError, Result};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of worker threads fed from a shared job queue.
///
/// Jobs submitted while every worker is busy wait in the queue, so the
/// number of workers bounds how many jobs run at the same time.
#[derive(Debug)]
pub struct ThreadPool {
    name: String,
    workers: Vec<Worker>,
    sender: Option<mpsc::Sender<Job>>,
}

impl ThreadPool {
    pub fn new(name: &str, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(DtpError::InvalidArgument(format!(
                "thread pool '{name}' needs at least one worker"
            )));
        }

        let mut workers = Vec::with_capacity(size);
        let (sender, receiver) = mpsc::channel();

        let receiver = Arc::new(Mutex::new(receiver));
        let sender = Some(sender);

        for i in 0..size {
            workers.push(Worker::new(name, i, Arc::clone(&receiver))?);
        }

        Ok(Self {
            name: name.to_string(),
            workers,
            sender,
        })
    }

    pub fn execute<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let job = Box::new(f);
        self.sender
            .as_ref()
            .ok_or(DtpError::ThreadPool)?
            .send(job)
            .map_err(|_| DtpError::ThreadPool)
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        drop(self.sender.take());

        for worker in self.workers.drain(..) {
            debug!("shutting down {} worker {}", self.name, worker.id);

            if worker.thread.join().is_err() {
                error!("{} worker {} panicked", self.name, worker.id);
            }
        }
    }
}

#[derive(Debug)]
struct Worker {
    id: usize,
    thread: thread::JoinHandle<()>,
}

impl Worker {
    fn new(name: &str, id: usize, receiver: Arc<Mutex<mpsc::Receiver<Job>>>) -> Result<Self> {
        let thread = thread::Builder::new()
            .name(format!("{name}-{id}"))
            .spawn(move || {
                loop {
                    let msg = match receiver.lock() {
                        Ok(receiver) => receiver.recv(),
                        Err(_) => break,
                    };
                    match msg {
                        Ok(job) => {
                            debug!("worker {id} picked up a job");
                            job();
                        }
                        Err(_) => {
                            debug!("worker {id} disconnected");
                            break;
                        }
                    }
                }
            })?;

        Ok(Self { id, thread })
    }
}

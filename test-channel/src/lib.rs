//! Unreliable datagram link for testing purposes.
//!
//! The protocol core never touches sockets, so its tests move datagrams
//! between two endpoints by hand. A `LossyLink` stands in for the network
//! between them and can drop, duplicate and delay datagrams.
#![deny(missing_docs)]
use rand::rngs::OsRng;
use rand::Rng;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

#[derive(Clone)]
struct LossyLoopback {
    px: Rc<Cell<f64>>,
    pq: Rc<Cell<f64>>,
    delayed: Rc<RefCell<VecDeque<Vec<u8>>>>,
    loopback: Rc<RefCell<VecDeque<Vec<u8>>>>,
}

impl LossyLoopback {
    fn new(px: f64, pq: f64) -> Self {
        Self {
            px: Rc::new(Cell::new(px)),
            pq: Rc::new(Cell::new(pq)),
            delayed: Default::default(),
            loopback: Default::default(),
        }
    }

    fn send(&self, datagram: &[u8]) {
        let fate: f64 = OsRng.gen();
        if fate < self.px.get() {
            self.loopback.borrow_mut().push_back(datagram.to_vec());
        }
        if fate < self.pq.get() {
            self.delayed.borrow_mut().push_back(datagram.to_vec());
        }
    }

    fn recv(&self) -> Option<Vec<u8>> {
        let datagram = self.loopback.borrow_mut().pop_front()?;
        let mut delayed = self.delayed.borrow_mut();
        self.loopback.borrow_mut().extend(delayed.drain(..));
        Some(datagram)
    }

    fn in_flight(&self) -> usize {
        self.loopback.borrow().len() + self.delayed.borrow().len()
    }

    fn set_conditions(&self, px: f64, pq: f64) {
        assert!(0.0 <= px && px <= 1.0);
        assert!(0.0 <= pq && pq <= 1.0);
        self.px.set(px);
        self.pq.set(pq);
    }
}

/// One end of a lossy link.
pub struct LossyLink {
    rx: LossyLoopback,
    tx: LossyLoopback,
}

impl LossyLink {
    /// Sends a datagram to the other end.
    pub fn send(&self, datagram: &[u8]) {
        self.tx.send(datagram)
    }

    /// Receives the next datagram, if one arrived.
    ///
    /// Receiving releases the datagrams that were held back, so they
    /// arrive after the one returned here.
    pub fn recv(&self) -> Option<Vec<u8>> {
        self.rx.recv()
    }

    /// Receives everything that is deliverable right now.
    pub fn drain(&self) -> Vec<Vec<u8>> {
        let mut datagrams = Vec::new();
        while let Some(datagram) = self.recv() {
            datagrams.push(datagram);
        }
        datagrams
    }

    /// Number of datagrams travelling towards the other end.
    pub fn in_flight(&self) -> usize {
        self.tx.in_flight()
    }

    /// Changes the conditions for datagrams sent from this end.
    ///
    /// With probabilities of 0 or 1 the fate of every datagram is fixed,
    /// so tests can lose (0, 0) or hold back (0, 1) exactly the datagrams
    /// they choose.
    pub fn set_conditions(&self, px: f64, pq: f64) {
        self.tx.set_conditions(px, pq)
    }
}

/// Lossy link builder.
pub struct LossyLinkBuilder {
    px: f64,
    pq: f64,
    rx: LossyLoopback,
    tx: LossyLoopback,
}

impl LossyLinkBuilder {
    /// Creates a new lossy link.
    ///
    /// The px parameter defines the probability of a datagram getting
    /// transmitted.
    /// The pq parameter defines the probability of a datagram getting
    /// queued.
    ///
    /// Through the combination of the px and pq parameters we can
    /// create links that are reliable (px=1.0, pq=0.0), simulate
    /// network partitions (px=0.0, pq=0.0), send all datagrams twice
    /// (px=1.0, pq=1.0) or anything in between.
    pub fn new(px: f64, pq: f64) -> Self {
        assert!(0.0 <= px && px <= 1.0);
        assert!(0.0 <= pq && pq <= 1.0);
        Self {
            px,
            pq,
            rx: LossyLoopback::new(px, pq),
            tx: LossyLoopback::new(px, pq),
        }
    }

    /// A link that delivers every datagram exactly once, in order.
    pub fn reliable() -> Self {
        Self::new(1.0, 0.0)
    }

    /// Splits the link into its two ends.
    pub fn split(self) -> (LossyLink, LossyLink) {
        let end1 = LossyLink {
            rx: self.rx.clone(),
            tx: self.tx.clone(),
        };
        let end2 = LossyLink {
            rx: self.tx,
            tx: self.rx,
        };
        (end1, end2)
    }
}

/// Enumerates the error conditions during transmission.
pub enum Tx {
    /// Successfull transmission
    Success,
    /// Datagram is delayed and will be received out of order.
    Delay,
    /// Datagram will be received twice.
    Duplicate,
    /// Datagram is dropped.
    Drop,
}

impl LossyLinkBuilder {
    /// Returns the probability of an error condition occuring.
    pub fn probability(&self, cond: Tx) -> f64 {
        match cond {
            Tx::Success => self.px * (1.0 - self.pq),
            Tx::Delay => (1.0 - self.px) * self.pq,
            Tx::Duplicate => self.px * self.pq,
            Tx::Drop => (1.0 - self.px) * (1.0 - self.pq),
        }
    }
}

impl std::fmt::Display for LossyLinkBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "p(transmission) = {}", self.px)?;
        writeln!(f, "p(queue) = {}", self.pq)?;
        writeln!(f, "p(success) = {}", self.probability(Tx::Success))?;
        writeln!(f, "p(delay) = {}", self.probability(Tx::Delay))?;
        writeln!(f, "p(duplicate) = {}", self.probability(Tx::Duplicate))?;
        writeln!(f, "p(drop) = {}", self.probability(Tx::Drop))?;
        Ok(())
    }
}

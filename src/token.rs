use std::fmt;

use may::sync::RwLock;
use serde::{Deserialize, Serialize};

use crate::errors::Error;

/// Leased handle of a dynamically created server object.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Token(i32);

impl Token {
    /// wrap a raw id
    pub const fn new(id: i32) -> Self {
        Token(id)
    }

    /// the "no target" token
    pub const fn none() -> Self {
        Token(0)
    }

    /// raw id
    pub fn id(self) -> i32 {
        self.0
    }

    /// true for `Token::none()`
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Fixed set of tokens `1..=capacity`, handed out and returned.
#[derive(Debug)]
pub struct TokenPool {
    capacity: usize,
    available: RwLock<Vec<Token>>,
}

impl TokenPool {
    /// create a pool holding `capacity` tokens
    pub fn new(capacity: usize) -> Self {
        // popped from the back, so token 1 goes out first
        let available = (1..=capacity as i32).rev().map(Token::new).collect();
        TokenPool {
            capacity,
            available: RwLock::new(available),
        }
    }

    /// lease a token
    pub fn request(&self) -> Result<Token, Error> {
        let mut available = self.available.write().unwrap();
        available.pop().ok_or(Error::TokenRequestFailed)
    }

    /// Returns a leased token. Tokens outside the pool and tokens that are
    /// already free are ignored.
    pub fn give_back(&self, token: Token) {
        if !self.contains(token) {
            warn!("token {token} does not belong to the pool");
            return;
        }
        let mut available = self.available.write().unwrap();
        if available.contains(&token) {
            warn!("token {token} returned twice");
            return;
        }
        available.push(token);
    }

    /// true if `token` is one of the pool's tokens
    pub fn contains(&self, token: Token) -> bool {
        token.id() >= 1 && token.id() as usize <= self.capacity
    }

    /// number of tokens
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// number of tokens not leased
    pub fn available(&self) -> usize {
        self.available.read().unwrap().len()
    }

    /// leased fraction of the pool
    pub fn utilization(&self) -> f32 {
        if self.capacity == 0 {
            return 1.0;
        }
        (self.capacity - self.available()) as f32 / self.capacity as f32
    }
}

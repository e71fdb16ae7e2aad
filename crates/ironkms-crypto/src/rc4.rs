use core::{fmt, ops};

/// RC4 stream cipher.
///
/// The V5 envelope keys every message independently, so the cipher is
/// constructed per call and consumed by `process`.
#[derive(Clone)]
pub struct Rc4 {
    i: usize,
    j: usize,
    state: State,
}

impl Rc4 {
    /// Runs the key scheduling algorithm over `key` (1 to 256 bytes).
    pub fn new(key: &[u8]) -> Self {
        assert!(!key.is_empty() && key.len() <= 256, "RC4 key must be 1 to 256 bytes");

        let mut state = State::default();
        for (i, item) in state.iter_mut().enumerate().take(256) {
            *item = i as u8;
        }
        let mut j = 0usize;
        for i in 0..256 {
            j = (j + state[i] as usize + key[i % key.len()] as usize) % 256;
            state.swap(i, j);
        }

        Self { i: 0, j: 0, state }
    }

    /// Applies the keystream to `message` (encryption and decryption
    /// are the same operation).
    pub fn process(&mut self, message: &[u8]) -> Vec<u8> {
        let mut output = Vec::with_capacity(message.len());
        while output.len() < message.len() {
            self.i = (self.i + 1) % 256;
            self.j = (self.j + self.state[self.i] as usize) % 256;
            self.state.swap(self.i, self.j);
            let idx_k = (self.state[self.i] as usize + self.state[self.j] as usize) % 256;
            let k = self.state[idx_k];
            let idx_msg = output.len();
            output.push(k ^ message[idx_msg]);
        }

        output
    }
}

impl fmt::Debug for Rc4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Keystream state stays out of logs.
        f.debug_struct("Rc4").finish_non_exhaustive()
    }
}

#[derive(Clone)]
struct State([u8; 256]);

impl Default for State {
    fn default() -> Self {
        Self([0; 256])
    }
}

impl ops::Deref for State {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl ops::DerefMut for State {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0.as_mut()
    }
}

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    /// No step 0 has run since construction.
    #[default]
    Uninitialized,
    /// The prompt step has run.
    Prefill,
    /// At least one incremental step has run.
    Decode,
}

/// Cross-call decoding state of one process.
///
/// Counters are reset by every `step == 0` call. The prefix settings
/// outlive sessions and change only through `set_prefix`/`unset_prefix`.
#[derive(Debug, Clone, Default)]
pub struct DecodingSession {
    /// Prompt length of the current session, prefix included.
    pub init_seq_len: usize,
    /// Tokens written into the KV cache so far.
    pub acc_seq_len: usize,
    pub prefix_seq_len: usize,
    pub prefix_sharing: bool,
    pub user_side_bs: usize,
    pub beam_size: usize,
    pub phase: SessionPhase,
}

impl DecodingSession {
    /// Start a new session with a `seq_len`-token prompt.
    pub fn begin(&mut self, seq_len: usize, user_side_bs: usize, beam_size: usize) {
        self.init_seq_len = seq_len;
        self.acc_seq_len = 0;
        self.user_side_bs = user_side_bs;
        self.beam_size = beam_size;
        self.phase = SessionPhase::Prefill;
    }

    /// Record `seq_len` more tokens in the cache.
    pub fn advance(&mut self, seq_len: usize) {
        self.acc_seq_len += seq_len;
    }

    /// Enter decode without running the prompt step: the caller has filled
    /// the cache up to `init_seq_len` some other way.
    pub fn skip_first_step(&mut self, init_seq_len: usize) {
        self.init_seq_len = init_seq_len;
        self.acc_seq_len = init_seq_len;
        self.phase = SessionPhase::Decode;
    }

    pub fn set_prefix(&mut self, prefix_seq_len: usize) {
        self.prefix_sharing = true;
        self.prefix_seq_len = prefix_seq_len;
    }

    pub fn unset_prefix(&mut self) {
        self.prefix_sharing = false;
        self.prefix_seq_len = 0;
    }

    pub fn is_started(&self) -> bool {
        self.phase != SessionPhase::Uninitialized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_resets_counters() {
        let mut session = DecodingSession::default();
        session.begin(8, 2, 1);
        session.advance(8);
        session.advance(1);
        assert_eq!(session.acc_seq_len, 9);
        session.begin(5, 1, 4);
        assert_eq!(session.acc_seq_len, 0);
        assert_eq!(session.init_seq_len, 5);
        assert_eq!(session.beam_size, 4);
    }

    #[test]
    fn skip_first_step_enters_decode() {
        let mut session = DecodingSession::default();
        assert!(!session.is_started());
        session.skip_first_step(12);
        assert_eq!(session.phase, SessionPhase::Decode);
        assert_eq!((session.init_seq_len, session.acc_seq_len), (12, 12));
    }

    #[test]
    fn prefix_survives_begin() {
        let mut session = DecodingSession::default();
        session.set_prefix(16);
        session.begin(20, 1, 1);
        assert!(session.prefix_sharing);
        assert_eq!(session.prefix_seq_len, 16);
        session.unset_prefix();
        assert!(!session.prefix_sharing);
    }
}

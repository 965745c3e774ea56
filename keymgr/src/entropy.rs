//! Entropy service: answers a network worker's periodic `ENTROPY_REQ` with
//! a fixed 1024-byte buffer (spec §4.F `ENTROPY_RESP`), grounded in the
//! teacher's `OcspCache` nonce pool (`rand::rng().fill(&mut pool[..])`).

use rand::Rng;

use supervisor_proto::bus::ENTROPY_LEN;

pub struct EntropyGenerator;

impl EntropyGenerator {
    pub fn new() -> Self {
        Self
    }

    pub fn generate(&self) -> Box<[u8; ENTROPY_LEN]> {
        let mut buf = Box::new([0u8; ENTROPY_LEN]);
        rand::rng().fill(&mut buf[..]);
        buf
    }
}

impl Default for EntropyGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_exactly_entropy_len_bytes() {
        let gen = EntropyGenerator::new();
        let buf = gen.generate();
        assert_eq!(buf.len(), ENTROPY_LEN);
    }

    #[test]
    fn two_draws_are_not_identical() {
        let gen = EntropyGenerator::new();
        assert_ne!(*gen.generate(), *gen.generate());
    }
}

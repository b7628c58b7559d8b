//! Six-sided dice pools.
//!
//! A die showing 5 or 6 is a hit. Edge rolls explode: every six adds
//! another die to a follow-up round until a round shows no sixes.

use rand::Rng;

/// Highest face of a die.
pub const SIDES: u8 = 6;

/// Lowest face that counts as a hit.
pub const HIT: u8 = 5;

/// Safety cap on exploding rounds.
const MAX_EXPLOSIONS: usize = 100;

/// Rolls `count` dice.
pub fn roll<R: Rng + ?Sized>(rng: &mut R, count: usize) -> Vec<u8> {
    (0..count).map(|_| rng.random_range(1..=SIDES)).collect()
}

/// Number of hits in a pool.
pub fn hits(dice: &[u8]) -> usize {
    dice.iter().filter(|&&d| d >= HIT).count()
}

/// Rolls `count` dice with exploding sixes.
///
/// The first round has `count` dice; each later round has one die per six
/// in the round before it.
pub fn exploding_sixes<R: Rng + ?Sized>(rng: &mut R, count: usize) -> Vec<Vec<u8>> {
    let mut rounds = Vec::new();
    let mut pending = count;
    while pending > 0 && rounds.len() < MAX_EXPLOSIONS {
        let round = roll(rng, pending);
        pending = round.iter().filter(|&&d| d == SIDES).count();
        rounds.push(round);
    }
    rounds
}

/// Rerolls every die of `previous` that was not a hit.
pub fn reroll_failures<R: Rng + ?Sized>(rng: &mut R, previous: &[u8]) -> Vec<u8> {
    let failures = previous.len() - hits(previous);
    roll(rng, failures)
}

/// A random display hue in degrees.
pub fn random_hue<R: Rng + ?Sized>(rng: &mut R) -> i32 {
    rng.random_range(0..360)
}

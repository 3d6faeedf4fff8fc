#![forbid(unsafe_code)]

use palaver_domain::{Gender, Participant};
use rand::Rng;
use rand::seq::IndexedRandom;

/// Per-gender nick pools for synthesized substitute participants.
const MALE_NICKS: &[&str] = &["Mateo", "Lucas", "Hugo", "Daniel", "Alejandro", "Leo", "Pablo", "Adrian"];
const FEMALE_NICKS: &[&str] = &["Lucia", "Sofia", "Martina", "Valeria", "Julia", "Emma", "Carla", "Vera"];

/// Whether `interest` accepts a partner of the given gender.
pub fn interest_accepts(interest: Gender, gender: Gender) -> bool {
	interest == Gender::Any || interest == gender
}

/// Mutual interest check, required in both directions: each side's interest
/// must be `any` or equal the other's stated gender.
pub fn mutually_compatible(a: &Participant, b: &Participant) -> bool {
	interest_accepts(a.interest, b.gender) && interest_accepts(b.interest, a.gender)
}

/// Synthesize a substitute participant satisfying the human's interest.
///
/// An interest of `any` resolves to a uniform coin flip between the two
/// genders; the nick is drawn uniformly from the matching pool.
pub fn synthesize_partner<R: Rng + ?Sized>(rng: &mut R, interest: Gender) -> Participant {
	let gender = match interest {
		Gender::Male => Gender::Male,
		Gender::Female => Gender::Female,
		Gender::Any => {
			if rng.random_bool(0.5) {
				Gender::Male
			} else {
				Gender::Female
			}
		}
	};

	let pool = match gender {
		Gender::Male => MALE_NICKS,
		_ => FEMALE_NICKS,
	};
	let nick = pool.choose(rng).copied().unwrap_or("Alex");

	Participant::substitute(nick, gender)
}

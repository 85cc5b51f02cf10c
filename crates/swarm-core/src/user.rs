use rand::distributions::Alphanumeric;
use rand::seq::IteratorRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::ops::RangeInclusive;

use crate::error::StateInconsistency;

pub const RATING_RANGE: RangeInclusive<u32> = 100..=99_999;
pub const LEADERBOARD_ID_RANGE: RangeInclusive<u16> = 0..=250;

const CREDENTIAL_LEN: usize = 6;

/// One leaderboard entry as sent in request bodies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardRow {
    #[serde(rename = "ClientId")]
    pub client_id: String,
    #[serde(rename = "Rating")]
    pub rating: u32,
    #[serde(rename = "LeaderboardId")]
    pub leaderboard_id: u16,
}

impl LeaderboardRow {
    pub fn random<R: Rng + ?Sized>(client_id: &str, rng: &mut R) -> Self {
        Self {
            client_id: client_id.to_string(),
            rating: random_rating(rng),
            leaderboard_id: rng.gen_range(LEADERBOARD_ID_RANGE),
        }
    }
}

pub fn random_rating<R: Rng + ?Sized>(rng: &mut R) -> u32 {
    rng.gen_range(RATING_RANGE)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user_name: String,
    pub password: String,
}

impl Credentials {
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self {
            user_name: random_string(rng, CREDENTIAL_LEN),
            password: random_string(rng, CREDENTIAL_LEN),
        }
    }
}

fn random_string<R: Rng + ?Sized>(rng: &mut R, len: usize) -> String {
    (0..len).map(|_| rng.sample(Alphanumeric) as char).collect()
}

/// Mutable data of a single virtual user. Owned by exactly one lifecycle.
#[derive(Debug)]
pub struct VirtualUserState {
    client_id: String,
    credentials: Credentials,
    auth_token: Option<String>,
    known_ids: BTreeSet<u16>,
}

impl VirtualUserState {
    pub fn new<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let client_id = uuid::Builder::from_random_bytes(rng.gen()).into_uuid();
        Self {
            client_id: client_id.to_string(),
            credentials: Credentials::random(rng),
            auth_token: None,
            known_ids: BTreeSet::new(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn auth_token(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }

    /// The first token sticks; a second assignment is reported and ignored.
    pub fn set_auth_token(&mut self, token: String) -> Result<(), StateInconsistency> {
        if self.auth_token.is_some() {
            return Err(StateInconsistency::TokenAlreadySet);
        }
        self.auth_token = Some(token);
        Ok(())
    }

    pub fn headers(&self) -> Vec<(String, String)> {
        match &self.auth_token {
            Some(token) => vec![("Authorization".to_string(), format!("Bearer {token}"))],
            None => Vec::new(),
        }
    }

    pub fn has_known_ids(&self) -> bool {
        !self.known_ids.is_empty()
    }

    pub fn known_ids(&self) -> &BTreeSet<u16> {
        &self.known_ids
    }

    pub fn contains(&self, leaderboard_id: u16) -> bool {
        self.known_ids.contains(&leaderboard_id)
    }

    /// Idempotent; returns whether the id was new.
    pub fn remember(&mut self, leaderboard_id: u16) -> bool {
        self.known_ids.insert(leaderboard_id)
    }

    pub fn forget(&mut self, leaderboard_id: u16) -> Result<(), StateInconsistency> {
        if self.known_ids.remove(&leaderboard_id) {
            Ok(())
        } else {
            Err(StateInconsistency::UnknownResource(leaderboard_id))
        }
    }

    /// Uniform pick over the known set.
    pub fn random_known_id<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<u16> {
        self.known_ids.iter().copied().choose(rng)
    }
}

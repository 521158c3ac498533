//! Event types for show-line contract events
//!
//! Every mutating contract call answers through exactly one of these:
//! - userAllocated: a session was given a user id
//! - turnAssigned: a user joined the line
//! - linePeeked: the head of the line was removed
//! - tokenRewarded / pointsRewarded: a user was rewarded

use crate::registry::{CorrelationKey, EventKind};
use alloy::sol;
use alloy_primitives::{B256, Log as PrimitiveLog, U256};
use alloy_sol_types::SolEvent;
use chrono::{DateTime, Utc};

// NOTE: contract events do not use indexed parameters
sol! {
    #[derive(Debug)]
    event userAllocated(string sessionID, uint256 userID);

    #[derive(Debug)]
    event turnAssigned(uint256 userID, uint256 turn);

    #[derive(Debug)]
    event linePeeked(uint256 userID);

    #[derive(Debug)]
    event tokenRewarded(uint256 userID, uint256 tokenId);

    #[derive(Debug)]
    event pointsRewarded(uint256 userID, uint256 points);
}

/// Parsed userAllocated event
#[derive(Debug, Clone, PartialEq)]
pub struct UserAllocatedEvent {
    /// Session that asked for the allocation
    pub session_id: String,
    /// Newly allocated user id
    pub user_id: U256,
    /// Transaction hash for correlation
    pub tx_hash: B256,
    /// Block number when event was emitted
    pub block_number: u64,
    /// Timestamp when event was received
    pub received_at: DateTime<Utc>,
}

/// Parsed turnAssigned event
#[derive(Debug, Clone, PartialEq)]
pub struct TurnAssignedEvent {
    pub user_id: U256,
    pub turn: U256,
    pub tx_hash: B256,
    pub block_number: u64,
    pub received_at: DateTime<Utc>,
}

/// Parsed linePeeked event
#[derive(Debug, Clone, PartialEq)]
pub struct LinePeekedEvent {
    /// User removed from the head of the line
    pub user_id: U256,
    pub tx_hash: B256,
    pub block_number: u64,
    pub received_at: DateTime<Utc>,
}

/// Parsed tokenRewarded event
#[derive(Debug, Clone, PartialEq)]
pub struct TokenRewardedEvent {
    pub user_id: U256,
    pub token_id: U256,
    pub tx_hash: B256,
    pub block_number: u64,
    pub received_at: DateTime<Utc>,
}

/// Parsed pointsRewarded event
#[derive(Debug, Clone, PartialEq)]
pub struct PointsRewardedEvent {
    pub user_id: U256,
    /// Cumulative points after the reward
    pub points: U256,
    pub tx_hash: B256,
    pub block_number: u64,
    pub received_at: DateTime<Utc>,
}

/// Wrapper enum for show-line events
#[derive(Debug, Clone, PartialEq)]
pub enum LineEvent {
    UserAllocated(UserAllocatedEvent),
    TurnAssigned(TurnAssignedEvent),
    LinePeeked(LinePeekedEvent),
    TokenRewarded(TokenRewardedEvent),
    PointsRewarded(PointsRewardedEvent),
}

impl LineEvent {
    /// Event kind used for registry lookups
    pub fn kind(&self) -> EventKind {
        match self {
            LineEvent::UserAllocated(_) => EventKind::AllocationConfirmed,
            LineEvent::TurnAssigned(_) => EventKind::TurnAssigned,
            LineEvent::LinePeeked(_) => EventKind::PeekCompleted,
            LineEvent::TokenRewarded(_) => EventKind::TokenRewarded,
            LineEvent::PointsRewarded(_) => EventKind::PointsRewarded,
        }
    }

    /// Key that routes this event to its waiter.
    ///
    /// linePeeked carries no per-caller discriminator, so it always routes
    /// to the sentinel.
    pub fn correlation_key(&self) -> CorrelationKey {
        match self {
            LineEvent::UserAllocated(e) => CorrelationKey::Session(e.session_id.clone()),
            LineEvent::TurnAssigned(e) => CorrelationKey::User(e.user_id),
            LineEvent::LinePeeked(_) => CorrelationKey::Sentinel,
            LineEvent::TokenRewarded(e) => CorrelationKey::User(e.user_id),
            LineEvent::PointsRewarded(e) => CorrelationKey::User(e.user_id),
        }
    }

    /// Value handed to the waiting caller
    pub fn payload(&self) -> U256 {
        match self {
            LineEvent::UserAllocated(e) => e.user_id,
            LineEvent::TurnAssigned(e) => e.turn,
            LineEvent::LinePeeked(e) => e.user_id,
            LineEvent::TokenRewarded(e) => e.token_id,
            LineEvent::PointsRewarded(e) => e.points,
        }
    }

    /// Get the transaction hash from the event
    pub fn tx_hash(&self) -> B256 {
        match self {
            LineEvent::UserAllocated(e) => e.tx_hash,
            LineEvent::TurnAssigned(e) => e.tx_hash,
            LineEvent::LinePeeked(e) => e.tx_hash,
            LineEvent::TokenRewarded(e) => e.tx_hash,
            LineEvent::PointsRewarded(e) => e.tx_hash,
        }
    }

    /// Get the block number from the event
    pub fn block_number(&self) -> u64 {
        match self {
            LineEvent::UserAllocated(e) => e.block_number,
            LineEvent::TurnAssigned(e) => e.block_number,
            LineEvent::LinePeeked(e) => e.block_number,
            LineEvent::TokenRewarded(e) => e.block_number,
            LineEvent::PointsRewarded(e) => e.block_number,
        }
    }
}

/// Event signature constants
pub struct EventSignatures;

impl EventSignatures {
    /// topic0 for an event kind
    pub fn for_kind(kind: EventKind) -> B256 {
        match kind {
            EventKind::AllocationConfirmed => userAllocated::SIGNATURE_HASH,
            EventKind::TurnAssigned => turnAssigned::SIGNATURE_HASH,
            EventKind::PeekCompleted => linePeeked::SIGNATURE_HASH,
            EventKind::TokenRewarded => tokenRewarded::SIGNATURE_HASH,
            EventKind::PointsRewarded => pointsRewarded::SIGNATURE_HASH,
        }
    }

    /// All event signatures, one per kind (for filtering)
    pub fn all() -> Vec<B256> {
        EventKind::ALL.iter().map(|k| Self::for_kind(*k)).collect()
    }
}

/// Parse a raw log into a LineEvent
pub fn parse_log(
    log: &PrimitiveLog,
    tx_hash: B256,
    block_number: u64,
) -> Result<LineEvent, EventParseError> {
    let topic0 = log.topics().first().ok_or(EventParseError::NoTopics)?;
    let received_at = Utc::now();

    if *topic0 == userAllocated::SIGNATURE_HASH {
        let decoded = userAllocated::decode_log(log)
            .map_err(|e| EventParseError::DecodeError(e.to_string()))?;

        Ok(LineEvent::UserAllocated(UserAllocatedEvent {
            session_id: decoded.sessionID.clone(),
            user_id: decoded.userID,
            tx_hash,
            block_number,
            received_at,
        }))
    } else if *topic0 == turnAssigned::SIGNATURE_HASH {
        let decoded = turnAssigned::decode_log(log)
            .map_err(|e| EventParseError::DecodeError(e.to_string()))?;

        Ok(LineEvent::TurnAssigned(TurnAssignedEvent {
            user_id: decoded.userID,
            turn: decoded.turn,
            tx_hash,
            block_number,
            received_at,
        }))
    } else if *topic0 == linePeeked::SIGNATURE_HASH {
        let decoded = linePeeked::decode_log(log)
            .map_err(|e| EventParseError::DecodeError(e.to_string()))?;

        Ok(LineEvent::LinePeeked(LinePeekedEvent {
            user_id: decoded.userID,
            tx_hash,
            block_number,
            received_at,
        }))
    } else if *topic0 == tokenRewarded::SIGNATURE_HASH {
        let decoded = tokenRewarded::decode_log(log)
            .map_err(|e| EventParseError::DecodeError(e.to_string()))?;

        Ok(LineEvent::TokenRewarded(TokenRewardedEvent {
            user_id: decoded.userID,
            token_id: decoded.tokenId,
            tx_hash,
            block_number,
            received_at,
        }))
    } else if *topic0 == pointsRewarded::SIGNATURE_HASH {
        let decoded = pointsRewarded::decode_log(log)
            .map_err(|e| EventParseError::DecodeError(e.to_string()))?;

        Ok(LineEvent::PointsRewarded(PointsRewardedEvent {
            user_id: decoded.userID,
            points: decoded.points,
            tx_hash,
            block_number,
            received_at,
        }))
    } else {
        Err(EventParseError::UnknownSignature(*topic0))
    }
}

/// Errors that can occur during event parsing
#[derive(Debug, Clone, thiserror::Error)]
pub enum EventParseError {
    /// Log has no topics
    #[error("Log has no topics")]
    NoTopics,
    /// Failed to decode event data
    #[error("Failed to decode event: {0}")]
    DecodeError(String),
    /// Unknown event signature
    #[error("Unknown event signature: {0}")]
    UnknownSignature(B256),
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::Address;

    fn encode(event: &impl SolEvent) -> PrimitiveLog {
        let data = event.encode_log_data();
        PrimitiveLog {
            address: Address::repeat_byte(7),
            data,
        }
    }

    #[test]
    fn test_all_signatures_distinct() {
        let sigs = EventSignatures::all();
        assert_eq!(sigs.len(), 5);
        for (i, a) in sigs.iter().enumerate() {
            assert_ne!(*a, B256::ZERO);
            for b in sigs.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_parse_user_allocated() {
        let log = encode(&userAllocated {
            sessionID: "session-42".to_string(),
            userID: U256::from(7),
        });

        let event = parse_log(&log, B256::repeat_byte(1), 12).unwrap();
        assert_eq!(event.kind(), EventKind::AllocationConfirmed);
        assert_eq!(
            event.correlation_key(),
            CorrelationKey::Session("session-42".to_string())
        );
        assert_eq!(event.payload(), U256::from(7));
        assert_eq!(event.block_number(), 12);
        assert_eq!(event.tx_hash(), B256::repeat_byte(1));
    }

    #[test]
    fn test_parse_line_peeked_routes_to_sentinel() {
        let log = encode(&linePeeked {
            userID: U256::from(3),
        });

        let event = parse_log(&log, B256::ZERO, 0).unwrap();
        assert_eq!(event.kind(), EventKind::PeekCompleted);
        assert_eq!(event.correlation_key(), CorrelationKey::Sentinel);
        assert_eq!(event.payload(), U256::from(3));
    }

    #[test]
    fn test_parse_user_keyed_events() {
        let turn = parse_log(
            &encode(&turnAssigned {
                userID: U256::from(9),
                turn: U256::from(4),
            }),
            B256::ZERO,
            0,
        )
        .unwrap();
        assert_eq!(turn.correlation_key(), CorrelationKey::User(U256::from(9)));
        assert_eq!(turn.payload(), U256::from(4));

        let token = parse_log(
            &encode(&tokenRewarded {
                userID: U256::from(9),
                tokenId: U256::from(100),
            }),
            B256::ZERO,
            0,
        )
        .unwrap();
        assert_eq!(token.kind(), EventKind::TokenRewarded);
        assert_eq!(token.payload(), U256::from(100));

        let points = parse_log(
            &encode(&pointsRewarded {
                userID: U256::from(9),
                points: U256::from(250),
            }),
            B256::ZERO,
            0,
        )
        .unwrap();
        assert_eq!(points.kind(), EventKind::PointsRewarded);
        assert_eq!(points.payload(), U256::from(250));
    }

    #[test]
    fn test_parse_unknown_signature() {
        let log = PrimitiveLog::new(
            Address::ZERO,
            vec![B256::repeat_byte(0xee)],
            Default::default(),
        )
        .unwrap();

        assert!(matches!(
            parse_log(&log, B256::ZERO, 0),
            Err(EventParseError::UnknownSignature(_))
        ));
    }

    #[test]
    fn test_parse_no_topics() {
        let log = PrimitiveLog::new(Address::ZERO, vec![], Default::default()).unwrap();
        assert!(matches!(
            parse_log(&log, B256::ZERO, 0),
            Err(EventParseError::NoTopics)
        ));
    }

    #[test]
    fn test_parse_truncated_data() {
        let log = PrimitiveLog::new(
            Address::ZERO,
            vec![turnAssigned::SIGNATURE_HASH],
            vec![0u8; 8].into(),
        )
        .unwrap();
        assert!(matches!(
            parse_log(&log, B256::ZERO, 0),
            Err(EventParseError::DecodeError(_))
        ));
    }
}

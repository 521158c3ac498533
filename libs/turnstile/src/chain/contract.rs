//! Show-line contract interface
//!
//! Mutating calls are fire-and-forget on chain: their results only come
//! back through the events declared in `event_types`.

use alloy::sol;
use alloy_primitives::{B256, U256, keccak256};
use alloy_sol_types::SolCall;

sol! {
    /// Queue/allocation contract backing the show line
    #[sol(rpc)]
    interface IShowLine {
        /// Allocate a user id for a session; emits userAllocated
        function allocateUser(string sessionID, bytes32 encodedKey) external;

        /// Append a user to the line; emits turnAssigned
        function addToLine(uint256 userID) external;

        /// Pop the head of the line; emits linePeeked
        function peek() external;

        /// Mint a game token for a user; emits tokenRewarded
        function rewardGameToken(uint256 userID, string nftUrl) external;

        /// Add points to a user; emits pointsRewarded
        function rewardPoints(uint256 userID, uint256 points) external;

        /// Turn currently held by a user (0 when not in line)
        function line_turn(uint256 userID) external view returns (uint256);

        /// User id at the head of the line
        function first_in_line() external view returns (uint256);
    }
}

/// A contract-mutating call, ready to be ABI encoded and submitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineCall {
    AllocateUser { session_id: String, encoded_key: B256 },
    AddToLine { user_id: U256 },
    Peek,
    RewardGameToken { user_id: U256, nft_url: String },
    RewardPoints { user_id: U256, points: U256 },
}

impl LineCall {
    /// Contract function name, used for logging
    pub fn name(&self) -> &'static str {
        match self {
            LineCall::AllocateUser { .. } => "allocateUser",
            LineCall::AddToLine { .. } => "addToLine",
            LineCall::Peek => "peek",
            LineCall::RewardGameToken { .. } => "rewardGameToken",
            LineCall::RewardPoints { .. } => "rewardPoints",
        }
    }

    /// ABI-encoded calldata for this call
    pub fn abi_encode(&self) -> Vec<u8> {
        match self {
            LineCall::AllocateUser {
                session_id,
                encoded_key,
            } => IShowLine::allocateUserCall {
                sessionID: session_id.clone(),
                encodedKey: *encoded_key,
            }
            .abi_encode(),
            LineCall::AddToLine { user_id } => {
                IShowLine::addToLineCall { userID: *user_id }.abi_encode()
            }
            LineCall::Peek => IShowLine::peekCall {}.abi_encode(),
            LineCall::RewardGameToken { user_id, nft_url } => IShowLine::rewardGameTokenCall {
                userID: *user_id,
                nftUrl: nft_url.clone(),
            }
            .abi_encode(),
            LineCall::RewardPoints { user_id, points } => IShowLine::rewardPointsCall {
                userID: *user_id,
                points: *points,
            }
            .abi_encode(),
        }
    }
}

/// Hash a secret word the way the contract expects it
/// (`keccak256(abi.encodePacked(string))`)
pub fn encode_key(secret_word: &str) -> B256 {
    keccak256(secret_word.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_key_is_packed_keccak() {
        // keccak256("") is a well known constant
        let empty: B256 = "0xc5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
            .parse()
            .unwrap();
        assert_eq!(encode_key(""), empty);
        assert_ne!(encode_key("apple"), encode_key("banana"));
        assert_eq!(encode_key("apple"), encode_key("apple"));
    }

    #[test]
    fn test_calldata_starts_with_selector() {
        let call = LineCall::AddToLine {
            user_id: U256::from(9),
        };
        let data = call.abi_encode();
        assert_eq!(&data[..4], IShowLine::addToLineCall::SELECTOR.as_slice());
        assert_eq!(data.len(), 4 + 32);
    }

    #[test]
    fn test_peek_has_no_arguments() {
        let data = LineCall::Peek.abi_encode();
        assert_eq!(data, IShowLine::peekCall::SELECTOR.to_vec());
    }

    #[test]
    fn test_call_names() {
        assert_eq!(LineCall::Peek.name(), "peek");
        assert_eq!(
            LineCall::RewardPoints {
                user_id: U256::ZERO,
                points: U256::from(5)
            }
            .name(),
            "rewardPoints"
        );
    }
}

//! Balance effect of each flow kind.
//!
//! One arm per [`FlowKind`]; adding a kind without deciding its posting is a
//! compile error.

use crate::errors::{Result, TreasuryError};
use arbor_types::{Address, BalanceField, BalanceOp, FlowKind, RewardFlow, TokenType};

/// Balance ops that realise `flow`. Applied when the flow is CONFIRMED.
pub fn postings(flow: &RewardFlow) -> Result<Vec<(Address, BalanceOp)>> {
    let user = flow.user_address;
    let field = BalanceField::for_token(flow.token_type);
    let ops = match flow.kind {
        FlowKind::Stake => vec![(
            user,
            BalanceOp::credit(BalanceField::TokenStakedPoints, flow.amount),
        )],
        FlowKind::Out => vec![(user, BalanceOp::debit(field, flow.amount))],
        FlowKind::In => vec![(user, BalanceOp::credit(field, flow.amount))],
        FlowKind::Transfer => {
            let to = flow
                .to_address
                .ok_or(TreasuryError::MissingDestinationAddress)?;
            vec![
                (user, BalanceOp::debit(field, flow.amount)),
                (to, BalanceOp::credit(field, flow.amount)),
            ]
        }
        FlowKind::NodeReward
        | FlowKind::NodeDiffReward
        | FlowKind::StakeStaticReward
        | FlowKind::StakeStaticDirectReward
        | FlowKind::StakeDynamicReward
        | FlowKind::StakeDynamicIncubationReward
        | FlowKind::FeeDividend
        | FlowKind::FeeDividendToken
        | FlowKind::Airdrop => vec![(user, BalanceOp::credit(field, flow.amount))],
        FlowKind::FlashSwap | FlowKind::Assemble => {
            let spent = flow
                .counter_amount
                .ok_or(TreasuryError::MalformedFlow("counter amount"))?;
            vec![
                (user, BalanceOp::debit(BalanceField::UsdtPoints, spent)),
                (
                    user,
                    BalanceOp::credit(BalanceField::for_token(TokenType::Token), flow.amount),
                ),
            ]
        }
    };
    Ok(ops)
}

/// Signed change `ops` make to `field` of `address`.
pub fn net_effect(
    ops: &[(Address, BalanceOp)],
    address: &Address,
    field: BalanceField,
) -> arbor_types::Amount {
    ops.iter()
        .filter(|(a, op)| a == address && op.field() == field)
        .map(|(_, op)| match *op {
            BalanceOp::Credit { amount, .. } => amount,
            BalanceOp::Debit { amount, .. } | BalanceOp::DrawUpTo { amount, .. } => -amount,
        })
        .sum()
}

use crate::errors::{LedgerEngineError, Result};
use crate::models::{Account, Direction, PostingInput};
use rust_decimal::Decimal;
use std::collections::HashMap;

/// Validates the double-entry invariants of a set of postings against the
/// locked account set. All arithmetic is exact decimal; amounts arrive as
/// strings and are parsed with `from_str_exact`.
pub fn validate_double_entry(
    postings: &[PostingInput],
    accounts: &HashMap<String, Account>,
) -> Result<()> {
    if postings.len() < 2 {
        return Err(LedgerEngineError::TooFewPostings);
    }

    let mut total_debits = Decimal::ZERO;
    let mut total_credits = Decimal::ZERO;

    for posting in postings {
        if !accounts.contains_key(&posting.account_code) {
            return Err(LedgerEngineError::UnknownAccount(
                posting.account_code.clone(),
            ));
        }

        let direction = Direction::parse(&posting.direction)
            .ok_or_else(|| LedgerEngineError::InvalidDirection(posting.direction.clone()))?;

        let amount = parse_amount(&posting.amount)?;

        match direction {
            Direction::Debit => total_debits += amount,
            Direction::Credit => total_credits += amount,
        }
    }

    if total_debits != total_credits {
        return Err(LedgerEngineError::UnbalancedPostings {
            debits: total_debits.to_string(),
            credits: total_credits.to_string(),
        });
    }

    Ok(())
}

/// Parses a positive exact decimal amount.
pub fn parse_amount(raw: &str) -> Result<Decimal> {
    let amount = Decimal::from_str_exact(raw)
        .map_err(|_| LedgerEngineError::InvalidAmount(raw.to_string()))?;

    if amount <= Decimal::ZERO {
        return Err(LedgerEngineError::InvalidAmount(raw.to_string()));
    }

    Ok(amount)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AccountType;
    use chrono::Utc;
    use uuid::Uuid;

    fn account(code: &str) -> Account {
        Account {
            id: Uuid::new_v4(),
            ledger_id: Uuid::new_v4(),
            code: code.to_string(),
            name: code.to_string(),
            account_type: AccountType::Asset,
            balance: Decimal::ZERO,
            created_at: Utc::now(),
        }
    }

    fn accounts(codes: &[&str]) -> HashMap<String, Account> {
        codes
            .iter()
            .map(|c| (c.to_string(), account(c)))
            .collect()
    }

    fn posting(code: &str, direction: &str, amount: &str) -> PostingInput {
        PostingInput {
            account_code: code.to_string(),
            direction: direction.to_string(),
            amount: amount.to_string(),
        }
    }

    #[test]
    fn accepts_balanced_postings() {
        let postings = vec![
            posting("cash", "debit", "100.00"),
            posting("revenue", "credit", "100.00"),
        ];
        assert!(validate_double_entry(&postings, &accounts(&["cash", "revenue"])).is_ok());
    }

    #[test]
    fn accepts_multi_leg_split() {
        let postings = vec![
            posting("cash", "debit", "70.25"),
            posting("fees", "debit", "29.75"),
            posting("revenue", "credit", "100.00"),
        ];
        assert!(
            validate_double_entry(&postings, &accounts(&["cash", "fees", "revenue"])).is_ok()
        );
    }

    #[test]
    fn rejects_single_posting() {
        let postings = vec![posting("cash", "debit", "100.00")];
        let err = validate_double_entry(&postings, &accounts(&["cash"])).unwrap_err();
        assert!(matches!(err, LedgerEngineError::TooFewPostings));
    }

    #[test]
    fn rejects_unknown_account() {
        let postings = vec![
            posting("cash", "debit", "100.00"),
            posting("nonexistent", "credit", "100.00"),
        ];
        let err = validate_double_entry(&postings, &accounts(&["cash"])).unwrap_err();
        assert!(matches!(err, LedgerEngineError::UnknownAccount(code) if code == "nonexistent"));
    }

    #[test]
    fn rejects_invalid_direction() {
        let postings = vec![
            posting("cash", "transfer", "100.00"),
            posting("revenue", "credit", "100.00"),
        ];
        let err = validate_double_entry(&postings, &accounts(&["cash", "revenue"])).unwrap_err();
        assert!(matches!(err, LedgerEngineError::InvalidDirection(_)));
    }

    #[test]
    fn rejects_imbalance_naming_both_sides() {
        let postings = vec![
            posting("cash", "debit", "100.00"),
            posting("revenue", "credit", "99.99"),
        ];
        let err = validate_double_entry(&postings, &accounts(&["cash", "revenue"])).unwrap_err();
        match err {
            LedgerEngineError::UnbalancedPostings { debits, credits } => {
                assert_eq!(debits, "100.00");
                assert_eq!(credits, "99.99");
            }
            other => panic!("expected UnbalancedPostings, got {other:?}"),
        }
    }

    #[test]
    fn rejects_non_positive_and_garbage_amounts() {
        for bad in ["0", "-5.00", "abc", "", "1.0e3"] {
            assert!(parse_amount(bad).is_err(), "{bad:?} should be rejected");
        }
        assert!(parse_amount("0.0000000001").is_ok());
    }

    #[test]
    fn exact_decimal_comparison_no_float_drift() {
        // 0.1 + 0.2 == 0.3 must hold exactly, unlike binary floats.
        let postings = vec![
            posting("a", "debit", "0.1"),
            posting("b", "debit", "0.2"),
            posting("c", "credit", "0.3"),
        ];
        assert!(validate_double_entry(&postings, &accounts(&["a", "b", "c"])).is_ok());
    }
}

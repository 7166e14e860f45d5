//! Deal scoring and filtering. Everything here is a pure function of its
//! arguments; the pricing lookup happens before `evaluate` is called.

use dealscout_core::{AlertHistory, DealScore, Listing, MarketQuote, Rejection, ScoredListing};
use rust_decimal::Decimal;

use crate::config::ScoringConfig;

/// History entries needed before price stability is judged.
pub const MIN_HISTORY_POINTS: usize = 10;

/// Proceeds from selling at `quote.price` after the configured fee assumptions.
pub fn net_proceeds(quote: &MarketQuote, scoring: &ScoringConfig) -> Decimal {
    let mut net = quote.price * (Decimal::ONE - scoring.referral_fee_rate);
    if scoring.apply_quote_fees {
        net -= quote.fees;
    }
    net
}

/// `(net - source) / market`, clamped to the score range. `market` must be positive.
pub fn deal_score(source_price: Decimal, net: Decimal, market_price: Decimal) -> DealScore {
    DealScore::clamped((net - source_price) / market_price)
}

/// Decides whether `listing` belongs in this run's digest.
///
/// Checks run in a fixed order: pricing, discount, threshold, the configured
/// market-signal filters, then alert history. An accepted listing comes back
/// with `market_price` filled in.
pub fn evaluate(
    mut listing: Listing,
    quote: Option<&MarketQuote>,
    history: &AlertHistory,
    scoring: &ScoringConfig,
) -> Result<ScoredListing, Rejection> {
    let quote = match quote {
        Some(q) if q.price > Decimal::ZERO => q,
        _ => return Err(Rejection::PricingUnavailable),
    };
    let market_price = quote.price;
    let net = net_proceeds(quote, scoring);

    if listing.source_price >= net {
        return Err(Rejection::NotDiscounted {
            source_price: listing.source_price,
            market_price,
        });
    }

    let score = deal_score(listing.source_price, net, market_price);
    if score.value() < scoring.min_deal_score {
        return Err(Rejection::BelowThreshold {
            score,
            threshold: scoring.min_deal_score,
        });
    }

    market_signals(listing.source_price, net, quote, scoring)?;

    if let Some(alerted_at) = history.active_alert(&listing.source_id) {
        return Err(Rejection::AlreadyAlerted { alerted_at });
    }

    listing.market_price = Some(market_price);
    Ok(ScoredListing {
        listing,
        score,
        market_reference: quote.reference.clone(),
    })
}

/// Profit floor, sales velocity, competition and price stability.
fn market_signals(
    source_price: Decimal,
    net: Decimal,
    quote: &MarketQuote,
    scoring: &ScoringConfig,
) -> Result<(), Rejection> {
    let profit = net - source_price;
    if profit < scoring.min_profit {
        return Err(Rejection::LowProfit {
            profit,
            min_profit: scoring.min_profit,
        });
    }

    if let Some(max_sales_rank) = scoring.max_sales_rank {
        if quote.sales_rank.map_or(true, |rank| rank > max_sales_rank) {
            return Err(Rejection::SlowSeller {
                sales_rank: quote.sales_rank,
                max_sales_rank,
            });
        }
    }

    if let Some(min_offer_count) = scoring.min_offer_count {
        if quote.offer_count.unwrap_or(0) < min_offer_count {
            return Err(Rejection::FewOffers {
                offer_count: quote.offer_count,
                min_offer_count,
            });
        }
    }

    if let (Some(max_deviation), Some(deviation)) = (
        scoring.max_price_deviation,
        quote.price_deviation(MIN_HISTORY_POINTS),
    ) {
        if deviation > max_deviation {
            return Err(Rejection::VolatilePrice {
                deviation,
                max_deviation,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use dealscout_core::{AlertRecord, RejectReason};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 20, 7, 0, 0).single().expect("ts")
    }

    fn listing(id: &str, source_price: i64) -> Listing {
        Listing {
            source_id: id.to_string(),
            title: format!("Item {id}"),
            source_price: Decimal::new(source_price, 0),
            market_price: None,
            currency: "USD".into(),
            extracted_at: now(),
            url: None,
            brand: None,
            in_stock: None,
        }
    }

    fn quote(price: i64) -> MarketQuote {
        MarketQuote::new(Decimal::new(price, 0))
    }

    fn empty_history() -> AlertHistory {
        AlertHistory::empty(now(), Duration::days(30))
    }

    #[test]
    fn discounted_listing_is_scored_and_accepted() {
        let scored = evaluate(listing("x1", 10), Some(&quote(25)), &empty_history(), &ScoringConfig::default())
            .expect("accepted");
        assert_eq!(scored.score.value(), Decimal::new(6, 1));
        assert_eq!(scored.listing.market_price, Some(Decimal::new(25, 0)));
    }

    #[test]
    fn missing_quote_is_pricing_unavailable() {
        let err = evaluate(listing("x1", 10), None, &empty_history(), &ScoringConfig::default())
            .expect_err("rejected");
        assert_eq!(err, Rejection::PricingUnavailable);

        let zero = evaluate(listing("x1", 10), Some(&quote(0)), &empty_history(), &ScoringConfig::default())
            .expect_err("rejected");
        assert_eq!(zero, Rejection::PricingUnavailable);
    }

    #[test]
    fn equal_or_higher_source_price_is_not_discounted() {
        for source in [25, 30] {
            let err = evaluate(listing("x1", source), Some(&quote(25)), &empty_history(), &ScoringConfig::default())
                .expect_err("rejected");
            assert_eq!(err.reason(), RejectReason::NotDiscounted);
        }
    }

    #[test]
    fn small_discount_is_below_threshold() {
        let err = evaluate(listing("x1", 22), Some(&quote(25)), &empty_history(), &ScoringConfig::default())
            .expect_err("rejected");
        assert_eq!(
            err,
            Rejection::BelowThreshold {
                score: DealScore::clamped(Decimal::new(12, 2)),
                threshold: Decimal::new(2, 1),
            }
        );
    }

    #[test]
    fn threshold_is_inclusive() {
        // (25 - 20) / 25 == 0.2 exactly
        assert!(evaluate(listing("x1", 20), Some(&quote(25)), &empty_history(), &ScoringConfig::default()).is_ok());
    }

    #[test]
    fn unexpired_alert_suppresses_and_expired_alert_does_not() {
        let recent = AlertHistory::from_records(
            [AlertRecord::new("x1", now() - Duration::days(3))],
            now(),
            Duration::days(30),
        );
        let err = evaluate(listing("x1", 10), Some(&quote(25)), &recent, &ScoringConfig::default())
            .expect_err("suppressed");
        assert_eq!(err.reason(), RejectReason::AlreadyAlerted);

        let stale = AlertHistory::from_records(
            [AlertRecord::new("x1", now() - Duration::days(31))],
            now(),
            Duration::days(30),
        );
        assert!(evaluate(listing("x1", 10), Some(&quote(25)), &stale, &ScoringConfig::default()).is_ok());
    }

    #[test]
    fn fee_assumptions_reduce_net_proceeds() {
        let scoring = ScoringConfig {
            min_deal_score: Decimal::new(1, 1),
            referral_fee_rate: Decimal::new(15, 2),
            apply_quote_fees: true,
            ..ScoringConfig::default()
        };
        let mut q = quote(100);
        q.fees = Decimal::new(5, 0);
        // net = 100 * 0.85 - 5 = 80; score = (80 - 60) / 100
        let scored = evaluate(listing("x1", 60), Some(&q), &empty_history(), &scoring).expect("accepted");
        assert_eq!(scored.score.value(), Decimal::new(2, 1));

        // below market but not below net proceeds
        let err = evaluate(listing("x2", 85), Some(&q), &empty_history(), &scoring).expect_err("rejected");
        assert_eq!(err.reason(), RejectReason::NotDiscounted);
    }

    #[test]
    fn evaluation_is_deterministic() {
        let history = empty_history();
        let scoring = ScoringConfig::default();
        let a = evaluate(listing("x1", 13), Some(&quote(29)), &history, &scoring);
        let b = evaluate(listing("x1", 13), Some(&quote(29)), &history, &scoring);
        assert_eq!(a, b);
    }

    fn strict() -> ScoringConfig {
        ScoringConfig {
            min_profit: Decimal::new(10, 0),
            max_sales_rank: Some(100_000),
            min_offer_count: Some(2),
            max_price_deviation: Some(Decimal::new(25, 2)),
            ..ScoringConfig::default()
        }
    }

    fn healthy_quote(price: i64) -> MarketQuote {
        MarketQuote {
            sales_rank: Some(8_000),
            offer_count: Some(6),
            price_history: vec![Decimal::new(price, 0); MIN_HISTORY_POINTS],
            ..quote(price)
        }
    }

    #[test]
    fn healthy_market_signals_pass_strict_filters() {
        assert!(evaluate(listing("x1", 10), Some(&healthy_quote(25)), &empty_history(), &strict()).is_ok());
    }

    #[test]
    fn small_absolute_profit_is_rejected() {
        // 40% discount but only 4 in absolute terms
        let err = evaluate(listing("x1", 6), Some(&healthy_quote(10)), &empty_history(), &strict())
            .expect_err("rejected");
        assert_eq!(
            err,
            Rejection::LowProfit {
                profit: Decimal::new(4, 0),
                min_profit: Decimal::new(10, 0),
            }
        );
    }

    #[test]
    fn slow_or_unranked_sellers_are_rejected() {
        let slow = MarketQuote {
            sales_rank: Some(250_000),
            ..healthy_quote(25)
        };
        let err = evaluate(listing("x1", 10), Some(&slow), &empty_history(), &strict()).expect_err("slow");
        assert_eq!(err.reason(), RejectReason::SlowSeller);

        let unranked = MarketQuote {
            sales_rank: None,
            ..healthy_quote(25)
        };
        let err = evaluate(listing("x1", 10), Some(&unranked), &empty_history(), &strict()).expect_err("unranked");
        assert_eq!(err.reason(), RejectReason::SlowSeller);
    }

    #[test]
    fn thin_competition_is_rejected() {
        let lonely = MarketQuote {
            offer_count: Some(1),
            ..healthy_quote(25)
        };
        let err = evaluate(listing("x1", 10), Some(&lonely), &empty_history(), &strict()).expect_err("few");
        assert_eq!(err.reason(), RejectReason::FewOffers);
    }

    #[test]
    fn spiking_price_is_rejected_only_with_enough_history() {
        let mut spiking = healthy_quote(25);
        spiking.price_history = vec![Decimal::new(15, 0); MIN_HISTORY_POINTS];
        let err = evaluate(listing("x1", 10), Some(&spiking), &empty_history(), &strict()).expect_err("volatile");
        assert_eq!(err.reason(), RejectReason::VolatilePrice);

        spiking.price_history.truncate(MIN_HISTORY_POINTS - 1);
        assert!(evaluate(listing("x1", 10), Some(&spiking), &empty_history(), &strict()).is_ok());
    }

    #[test]
    fn default_scoring_ignores_missing_market_signals() {
        let bare = quote(25);
        assert!(bare.sales_rank.is_none() && bare.offer_count.is_none());
        assert!(evaluate(listing("x1", 10), Some(&bare), &empty_history(), &ScoringConfig::default()).is_ok());
    }
}

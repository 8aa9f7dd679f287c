//! Property-based tests for the order/inventory core.
//!
//! Quantified invariants: money arithmetic stays in range, status history
//! is always a walk on the transition table, encrypted fields round-trip,
//! topic matching behaves like AMQP, and any sequence of reservation
//! operations leaves item quantities consistent with the set of active
//! holds.

mod common;

use proptest::prelude::*;

use cardforge_api::encryption::{EncryptionService, StaticKeyCipher};
use cardforge_api::entities::{OrderStatus, ReservationStatus};
use cardforge_api::message_queue::topic_matches;
use cardforge_api::money;
use cardforge_api::services::{ReserveLine, ReserveOutcome};
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use std::time::Duration;
use strum::IntoEnumIterator;
use uuid::Uuid;

fn status_strategy() -> impl Strategy<Value = OrderStatus> {
    prop::sample::select(OrderStatus::iter().collect::<Vec<_>>())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    #[test]
    fn tax_is_bounded_by_subtotal(subtotal in 0i64..10_000_000, bps in 0u32..=10_000) {
        let tax = money::tax_for(subtotal, bps).unwrap();
        prop_assert!(tax >= 0);
        prop_assert!(tax <= subtotal);
    }

    #[test]
    fn order_total_is_the_sum_of_parts(
        subtotal in 0i64..1_000_000_000,
        tax in 0i64..1_000_000_000,
        shipping in 0i64..1_000_000_000,
    ) {
        let total = money::order_total(subtotal, tax, shipping).unwrap();
        prop_assert_eq!(total, subtotal + tax + shipping);
    }

    #[test]
    fn subtotal_matches_manual_sum(lines in prop::collection::vec((1i32..100, 0i64..100_000), 1..10)) {
        let expected: i64 = lines.iter().map(|(q, p)| *q as i64 * p).sum();
        prop_assert_eq!(money::subtotal(lines.iter().copied()).unwrap(), expected);
    }

    #[test]
    fn transitions_out_of_terminal_states_never_validate(next in status_strategy()) {
        prop_assert!(!OrderStatus::Delivered.can_transition_to(next));
        prop_assert!(!OrderStatus::Cancelled.can_transition_to(next));
    }

    #[test]
    fn random_walks_stay_on_the_table(steps in prop::collection::vec(status_strategy(), 0..12)) {
        // Apply only the steps the table admits; the result must always be
        // a valid walk from Pending.
        let mut walk = vec![OrderStatus::Pending];
        let mut current = OrderStatus::Pending;
        for step in steps {
            if current.can_transition_to(step) {
                walk.push(step);
                current = step;
            }
        }
        for pair in walk.windows(2) {
            prop_assert!(pair[0].can_transition_to(pair[1]));
        }
    }

    #[test]
    fn encryption_round_trips(plaintext in ".*", key in prop::collection::vec(any::<u8>(), 1..64)) {
        let cipher = StaticKeyCipher::new(key).unwrap();
        let opaque = cipher.encrypt(&plaintext).unwrap();
        prop_assert_eq!(cipher.decrypt(&opaque).unwrap(), plaintext);
    }

    #[test]
    fn every_key_matches_itself(key in "[a-z]{1,8}(\\.[a-z]{1,8}){0,3}") {
        prop_assert!(topic_matches(&key, &key));
        prop_assert!(topic_matches("#", &key));
    }

    #[test]
    fn star_requires_equal_segment_count(key in "[a-z]{1,8}(\\.[a-z]{1,8}){0,3}") {
        let segments = key.split('.').count();
        let all_stars = vec!["*"; segments].join(".");
        prop_assert!(topic_matches(&all_stars, &key));

        let extra_star = format!("{}.{}", all_stars, "*");
        prop_assert!(!topic_matches(&extra_star, &key));
    }
}

/// One step of the reservation-engine state machine exercised below.
#[derive(Debug, Clone)]
enum EngineOp {
    Reserve { order: usize, quantity: i32 },
    Release { order: usize },
    Confirm { order: usize },
    Sweep,
}

fn engine_op_strategy() -> impl Strategy<Value = EngineOp> {
    prop_oneof![
        (0usize..3, 1i32..4).prop_map(|(order, quantity)| EngineOp::Reserve { order, quantity }),
        (0usize..3).prop_map(|order| EngineOp::Release { order }),
        (0usize..3).prop_map(|order| EngineOp::Confirm { order }),
        Just(EngineOp::Sweep),
    ]
}

proptest! {
    // Each case spins up a fresh in-memory store; keep the count modest.
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn reservation_sequences_preserve_quantity_invariants(
        initial_available in 0i32..12,
        ops in prop::collection::vec(engine_op_strategy(), 1..10),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async move {
            let ctx = common::setup().await;
            let item = common::seed_item(&ctx, "Prop Test Card", initial_available, 100).await;
            let order_ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();

            for op in ops {
                match op {
                    EngineOp::Reserve { order, quantity } => {
                        let result = ctx
                            .engine
                            .reserve(
                                order_ids[order],
                                Uuid::new_v4(),
                                &[ReserveLine { item_id: item.id, quantity }],
                                Some(Duration::from_secs(60)),
                            )
                            .await;
                        match result {
                            Ok(ReserveOutcome::Reserved { .. })
                            | Ok(ReserveOutcome::Unavailable(_)) => {}
                            Err(cardforge_api::ServiceError::Conflict(_)) => {}
                            Err(e) => panic!("unexpected reserve error: {}", e),
                        }
                    }
                    EngineOp::Release { order } => {
                        match ctx.engine.release(order_ids[order]).await {
                            Ok(())
                            | Err(cardforge_api::ServiceError::NotFound(_))
                            | Err(cardforge_api::ServiceError::Conflict(_)) => {}
                            Err(e) => panic!("unexpected release error: {}", e),
                        }
                    }
                    EngineOp::Confirm { order } => {
                        match ctx.engine.confirm(order_ids[order]).await {
                            Ok(())
                            | Err(cardforge_api::ServiceError::NotFound(_))
                            | Err(cardforge_api::ServiceError::Conflict(_)) => {}
                            Err(e) => panic!("unexpected confirm error: {}", e),
                        }
                    }
                    EngineOp::Sweep => {
                        // Sweep far in the future so every active hold expires.
                        ctx.engine
                            .sweep_expired(chrono::Utc::now() + chrono::Duration::hours(1))
                            .await
                            .unwrap();
                    }
                }
            }

            // Quiescent invariants.
            let final_item = common::fetch_item(&ctx, item.id).await;
            assert!(final_item.available_quantity >= 0);
            assert!(final_item.reserved_quantity >= 0);
            assert!(final_item.available_quantity >= final_item.reserved_quantity);

            use cardforge_api::entities::reservation::{self, Entity as ReservationEntity};
            use cardforge_api::entities::reservation_line::{self, Entity as ReservationLineEntity};

            let active_sum: i32 = ReservationLineEntity::find()
                .filter(reservation_line::Column::ItemId.eq(item.id))
                .inner_join(ReservationEntity)
                .filter(reservation::Column::Status.eq(ReservationStatus::Active.as_str()))
                .all(&*ctx.item_store)
                .await
                .unwrap()
                .iter()
                .map(|l| l.quantity)
                .sum();
            assert_eq!(final_item.reserved_quantity, active_sum);

            // Timestamp shape per terminal reservation state.
            for reservation in ReservationEntity::find()
                .all(&*ctx.item_store)
                .await
                .unwrap()
            {
                match reservation.status_parsed().unwrap() {
                    ReservationStatus::Confirmed => {
                        assert!(reservation.confirmed_at.is_some());
                        assert!(reservation.released_at.is_none());
                    }
                    ReservationStatus::Released | ReservationStatus::Expired => {
                        assert!(reservation.released_at.is_some());
                        assert!(reservation.confirmed_at.is_none());
                    }
                    ReservationStatus::Active => {}
                }
            }
        });
    }
}

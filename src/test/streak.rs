#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use crate::error::AppError;
    use crate::ledger::{NewTransaction, append_points, get_user_points};
    use crate::models::ReasonCode;
    use crate::streak::{TouchOutcome, get_streak, next_streak, touch};
    use crate::test::test_utils::{TestDb, TestDbBuilder};

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, d).unwrap()
    }

    async fn single_student() -> TestDb {
        TestDbBuilder::new()
            .organization("Acme")
            .student("alice", "Acme")
            .build()
            .await
            .expect("Failed to build test database")
    }

    #[test]
    fn test_next_streak_transitions() {
        assert_eq!(next_streak(None, day(1)).unwrap(), (TouchOutcome::Started, 1, 1));

        let stored = crate::models::StudyStreak {
            user_id: 1,
            current_streak: 4,
            longest_streak: 9,
            last_study_date: day(10),
            updated_at: day(10).and_hms_opt(0, 0, 0).unwrap(),
        };

        assert_eq!(
            next_streak(Some(&stored), day(10)).unwrap(),
            (TouchOutcome::Unchanged, 4, 9)
        );
        assert_eq!(
            next_streak(Some(&stored), day(11)).unwrap(),
            (TouchOutcome::Extended, 5, 9)
        );
        assert_eq!(
            next_streak(Some(&stored), day(14)).unwrap(),
            (TouchOutcome::Restarted, 1, 9)
        );
        assert!(matches!(
            next_streak(Some(&stored), day(8)),
            Err(AppError::OutOfOrderActivity { .. })
        ));
    }

    #[rocket::async_test]
    async fn test_same_day_touch_is_idempotent() {
        let test_db = single_student().await;
        let alice = test_db.user_id("alice");

        let first = touch(&test_db.pool, alice, day(5)).await.unwrap();
        assert_eq!(first.outcome, TouchOutcome::Started);
        assert_eq!(first.streak.current_streak, 1);

        let second = touch(&test_db.pool, alice, day(5)).await.unwrap();
        assert_eq!(second.outcome, TouchOutcome::Unchanged);
        assert_eq!(second.streak.current_streak, 1);
        assert_eq!(second.streak.longest_streak, 1);
    }

    #[rocket::async_test]
    async fn test_consecutive_days_extend() {
        let test_db = single_student().await;
        let alice = test_db.user_id("alice");

        for d in 1..=3 {
            touch(&test_db.pool, alice, day(d)).await.unwrap();
        }

        let streak = get_streak(&test_db.pool, alice).await.unwrap().unwrap();
        assert_eq!(streak.current_streak, 3);
        assert_eq!(streak.longest_streak, 3);
        assert_eq!(streak.last_study_date, day(3));
    }

    #[rocket::async_test]
    async fn test_gap_restarts_but_keeps_longest() {
        let test_db = single_student().await;
        let alice = test_db.user_id("alice");

        for d in 1..=5 {
            touch(&test_db.pool, alice, day(d)).await.unwrap();
        }

        let update = touch(&test_db.pool, alice, day(8)).await.unwrap();
        assert_eq!(update.outcome, TouchOutcome::Restarted);
        assert_eq!(update.streak.current_streak, 1);
        assert_eq!(update.streak.longest_streak, 5);
    }

    #[rocket::async_test]
    async fn test_out_of_order_activity_rejected() {
        let test_db = single_student().await;
        let alice = test_db.user_id("alice");

        touch(&test_db.pool, alice, day(10)).await.unwrap();
        let result = touch(&test_db.pool, alice, day(9)).await;
        assert!(matches!(result, Err(AppError::OutOfOrderActivity { .. })));

        let streak = get_streak(&test_db.pool, alice).await.unwrap().unwrap();
        assert_eq!(streak.last_study_date, day(10));
    }

    #[rocket::async_test]
    async fn test_streak_mirrored_into_user_points() {
        let test_db = single_student().await;
        let alice = test_db.user_id("alice");

        touch(&test_db.pool, alice, day(1)).await.unwrap();

        // Aggregate row created after the streak copies its values.
        append_points(
            &test_db.pool,
            &test_db.config,
            NewTransaction {
                user_id: alice,
                delta: 10,
                reason: ReasonCode::LessonComplete,
                description: "lesson",
                idempotency_key: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(get_user_points(&test_db.pool, alice).await.unwrap().current_streak, 1);

        touch(&test_db.pool, alice, day(2)).await.unwrap();
        let aggregate = get_user_points(&test_db.pool, alice).await.unwrap();
        assert_eq!(aggregate.current_streak, 2);
        assert_eq!(aggregate.longest_streak, 2);
    }

    #[rocket::async_test]
    async fn test_concurrent_same_day_touches_count_once() {
        let test_db = single_student().await;
        let alice = test_db.user_id("alice");

        touch(&test_db.pool, alice, day(1)).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = test_db.pool.clone();
            handles.push(rocket::tokio::spawn(async move { touch(&pool, alice, day(2)).await }));
        }

        let mut extended = 0;
        for handle in handles {
            let update = handle.await.expect("Task panicked").expect("Touch failed");
            if update.outcome == TouchOutcome::Extended {
                extended += 1;
            }
            assert_eq!(update.streak.current_streak, 2);
        }

        assert_eq!(extended, 1);
        let streak = get_streak(&test_db.pool, alice).await.unwrap().unwrap();
        assert_eq!(streak.current_streak, 2);
    }

    #[rocket::async_test]
    async fn test_touch_unknown_user() {
        let test_db = single_student().await;
        let result = touch(&test_db.pool, 4242, day(1)).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }
}

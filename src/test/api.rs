#[cfg(test)]
mod tests {
    use rocket::http::{ContentType, Header, Status};
    use rocket::local::asynchronous::{Client, LocalResponse};
    use serde_json::{Value, json};

    use crate::api::CreatedResponse;
    use crate::auth::USER_ID_HEADER;
    use crate::db::set_user_active;
    use crate::ledger::total_for;
    use crate::test::test_utils::{create_standard_test_db, setup_test_client};

    fn as_user(id: i64) -> Header<'static> {
        Header::new(USER_ID_HEADER, id.to_string())
    }

    async fn json_body(response: LocalResponse<'_>) -> Value {
        response
            .into_json::<Value>()
            .await
            .expect("Response should be JSON")
    }

    async fn post_event(client: &Client, caller: i64, target: i64, event: Value) -> LocalResponse<'_> {
        client
            .post(format!("/api/users/{}/events", target))
            .header(as_user(caller))
            .header(ContentType::JSON)
            .body(json!({ "event": event }).to_string())
            .dispatch()
            .await
    }

    #[rocket::async_test]
    async fn test_health() {
        let (client, _) = setup_test_client(create_standard_test_db().await).await;

        let response = client.get("/api/health").dispatch().await;
        assert_eq!(response.status(), Status::Ok);
        assert_eq!(response.into_string().await.unwrap(), "OK");
    }

    #[rocket::async_test]
    async fn test_identity_header_required() {
        let (client, test_db) = setup_test_client(create_standard_test_db().await).await;

        let response = client.get("/api/me").dispatch().await;
        assert_eq!(response.status(), Status::Unauthorized);
        let body = json_body(response).await;
        assert_eq!(body["error"], "Unauthorized");

        let response = client
            .get("/api/me")
            .header(Header::new(USER_ID_HEADER, "not-a-number"))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Unauthorized);

        let response = client.get("/api/me").header(as_user(424242)).dispatch().await;
        assert_eq!(response.status(), Status::Unauthorized);

        let alice = test_db.user_id("alice");
        let response = client.get("/api/me").header(as_user(alice)).dispatch().await;
        assert_eq!(response.status(), Status::Ok);
        let body = json_body(response).await;
        assert_eq!(body["id"], alice);
        assert_eq!(body["role"], "student");
    }

    #[rocket::async_test]
    async fn test_deactivated_user_is_forbidden() {
        let (client, test_db) = setup_test_client(create_standard_test_db().await).await;
        let bob = test_db.user_id("bob");

        set_user_active(&test_db.pool, bob, false).await.unwrap();

        let response = client.get("/api/me").header(as_user(bob)).dispatch().await;
        assert_eq!(response.status(), Status::Forbidden);
        let body = json_body(response).await;
        assert_eq!(body["error"], "Forbidden");
    }

    #[rocket::async_test]
    async fn test_lesson_event_flow() {
        let (client, test_db) = setup_test_client(create_standard_test_db().await).await;
        let alice = test_db.user_id("alice");
        let prof = test_db.user_id("prof_plum");

        let response = post_event(
            &client,
            prof,
            alice,
            json!({ "type": "lesson_completed", "lesson_id": 7 }),
        )
        .await;
        assert_eq!(response.status(), Status::Ok);
        let outcome = json_body(response).await;
        assert!(outcome["transaction_id"].is_i64());
        assert_eq!(outcome["streak"]["outcome"], "started");
        assert!(outcome["streak_bonus_transaction"].is_null());
        let mut unlocked: Vec<&str> = outcome["unlocked"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|a| a["name"].as_str())
            .collect();
        unlocked.sort();
        // Alone on the board, the first lesson also puts alice in the top three.
        assert_eq!(unlocked, vec!["First Steps", "Top Student"]);

        // Redelivery of the same event changes nothing.
        let response = post_event(
            &client,
            prof,
            alice,
            json!({ "type": "lesson_completed", "lesson_id": 7 }),
        )
        .await;
        assert_eq!(response.status(), Status::Ok);
        let outcome = json_body(response).await;
        assert!(outcome["unlocked"].as_array().unwrap().is_empty());

        let response = client
            .get(format!("/api/users/{}/points", alice))
            .header(as_user(alice))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let points = json_body(response).await;
        assert_eq!(points["total_points"], 170);
        assert_eq!(points["lessons_completed"], 1);
        assert_eq!(points["current_streak"], 1);

        let response = client
            .get(format!("/api/users/{}/history?limit=10", alice))
            .header(as_user(alice))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let page = json_body(response).await;
        assert_eq!(page["items"].as_array().unwrap().len(), 3);

        let response = client
            .get(format!("/api/users/{}/achievements", alice))
            .header(as_user(alice))
            .dispatch()
            .await;
        let unlocked = json_body(response).await;
        assert_eq!(unlocked.as_array().unwrap().len(), 2);
    }

    #[rocket::async_test]
    async fn test_students_cannot_report_their_own_events() {
        let (client, test_db) = setup_test_client(create_standard_test_db().await).await;
        let alice = test_db.user_id("alice");

        for course_id in 1..=3 {
            let response = post_event(
                &client,
                alice,
                alice,
                json!({ "type": "course_completed", "course_id": course_id }),
            )
            .await;
            assert_eq!(response.status(), Status::Forbidden);
            let body = json_body(response).await;
            assert!(body["errors"]["authorization"].is_array());
        }
        assert_eq!(total_for(&test_db.pool, alice).await.unwrap(), 0);

        // Plain study activity and watch time stay self-service.
        let response = client
            .post(format!("/api/users/{}/activity", alice))
            .header(as_user(alice))
            .header(ContentType::JSON)
            .body(json!({}).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);

        let response = client
            .post(format!("/api/users/{}/watch-time", alice))
            .header(as_user(alice))
            .header(ContentType::JSON)
            .body(json!({ "lesson_id": 4, "watched_seconds": 90 }).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        assert_eq!(total_for(&test_db.pool, alice).await.unwrap(), 0);
    }

    #[rocket::async_test]
    async fn test_student_cannot_touch_other_users() {
        let (client, test_db) = setup_test_client(create_standard_test_db().await).await;
        let alice = test_db.user_id("alice");
        let bob = test_db.user_id("bob");
        let gina = test_db.user_id("gina");
        let prof = test_db.user_id("prof_plum");

        let response = client
            .get(format!("/api/users/{}/points", bob))
            .header(as_user(alice))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Forbidden);
        let body = json_body(response).await;
        assert!(body["errors"]["authorization"].is_array());

        let response = post_event(
            &client,
            alice,
            bob,
            json!({ "type": "quiz_passed", "quiz_id": 1 }),
        )
        .await;
        assert_eq!(response.status(), Status::Forbidden);

        // Professors act within their own organization only.
        let response = post_event(
            &client,
            prof,
            bob,
            json!({ "type": "quiz_passed", "quiz_id": 1 }),
        )
        .await;
        assert_eq!(response.status(), Status::Ok);

        let response = client
            .get(format!("/api/users/{}/points", gina))
            .header(as_user(prof))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Forbidden);

        let response = client
            .get(format!(
                "/api/organizations/{}/leaderboard",
                test_db.organization_id("Globex Academy")
            ))
            .header(as_user(alice))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Forbidden);
    }

    #[rocket::async_test]
    async fn test_leaderboard_endpoints() {
        let (client, test_db) = setup_test_client(create_standard_test_db().await).await;
        let alice = test_db.user_id("alice");
        let bob = test_db.user_id("bob");
        let prof = test_db.user_id("prof_plum");
        let acme = test_db.organization_id("Acme University");

        let response = post_event(
            &client,
            prof,
            alice,
            json!({ "type": "course_completed", "course_id": 1 }),
        )
        .await;
        assert_eq!(response.status(), Status::Ok);
        let response = post_event(
            &client,
            prof,
            bob,
            json!({ "type": "forum_post", "post_id": 3 }),
        )
        .await;
        assert_eq!(response.status(), Status::Ok);

        let response = client
            .get(format!("/api/organizations/{}/leaderboard?limit=5", acme))
            .header(as_user(bob))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let board = json_body(response).await;
        let entries = board.as_array().unwrap();
        assert_eq!(entries[0]["user_id"], alice);
        assert_eq!(entries[0]["rank"], 1);
        assert_eq!(entries[1]["user_id"], bob);
        assert_eq!(entries[1]["rank"], 2);

        let response = client
            .get(format!("/api/organizations/{}/leaderboard?window=weekly", acme))
            .header(as_user(bob))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        assert_eq!(json_body(response).await.as_array().unwrap().len(), 2);

        let response = client
            .get(format!("/api/organizations/{}/leaderboard?window=monthly", acme))
            .header(as_user(bob))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::BadRequest);
        let body = json_body(response).await;
        assert!(body["errors"]["window"].is_array());

        let response = client
            .get(format!("/api/users/{}/rank", bob))
            .header(as_user(bob))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let rank = json_body(response).await;
        assert_eq!(rank["rank"], 2);
    }

    #[rocket::async_test]
    async fn test_manual_points_require_admin() {
        let (client, test_db) = setup_test_client(create_standard_test_db().await).await;
        let alice = test_db.user_id("alice");
        let admin = test_db.user_id("admin_ada");

        let request = json!({
            "user_id": alice,
            "delta": 25,
            "reason": "admin_adjustment",
            "description": "Helped run the study group",
            "idempotency_key": "adjust:study-group"
        });

        let response = client
            .post("/api/points")
            .header(as_user(alice))
            .header(ContentType::JSON)
            .body(request.to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Forbidden);

        let response = client
            .post("/api/points")
            .header(as_user(admin))
            .header(ContentType::JSON)
            .body(request.to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Created);
        let first = response.into_json::<CreatedResponse>().await.unwrap();

        let response = client
            .post("/api/points")
            .header(as_user(admin))
            .header(ContentType::JSON)
            .body(request.to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Created);
        let second = response.into_json::<CreatedResponse>().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(total_for(&test_db.pool, alice).await.unwrap(), 25);

        let response = client
            .post("/api/points")
            .header(as_user(admin))
            .header(ContentType::JSON)
            .body(
                json!({
                    "user_id": alice,
                    "delta": 5,
                    "reason": "bribery",
                    "description": ""
                })
                .to_string(),
            )
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::BadRequest);
        let body = json_body(response).await;
        assert!(body["errors"]["reason"].is_array());

        let response = client
            .post("/api/points")
            .header(as_user(admin))
            .header(ContentType::JSON)
            .body(
                json!({
                    "user_id": alice,
                    "delta": 0,
                    "reason": "admin_adjustment",
                    "description": "nothing"
                })
                .to_string(),
            )
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::BadRequest);
        let body = json_body(response).await;
        assert!(body["errors"]["delta"].is_array());
    }

    #[rocket::async_test]
    async fn test_request_validation() {
        let (client, test_db) = setup_test_client(create_standard_test_db().await).await;
        let admin = test_db.user_id("admin_ada");
        let acme = test_db.organization_id("Acme University");

        let response = client
            .post("/api/users")
            .header(as_user(admin))
            .header(ContentType::JSON)
            .body(
                json!({
                    "display_name": "",
                    "role": "student",
                    "organization_id": acme
                })
                .to_string(),
            )
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::UnprocessableEntity);
        let body = json_body(response).await;
        assert_eq!(body["status"], "error");
        assert!(body["errors"]["display_name"].is_array());

        let response = client
            .post("/api/users")
            .header(as_user(admin))
            .header(ContentType::JSON)
            .body(
                json!({
                    "display_name": "Carol",
                    "role": "student",
                    "organization_id": acme
                })
                .to_string(),
            )
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Created);

        // Admins cannot mint superadmins.
        let response = client
            .post("/api/users")
            .header(as_user(admin))
            .header(ContentType::JSON)
            .body(json!({ "display_name": "Mallory", "role": "superadmin" }).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Forbidden);
    }

    #[rocket::async_test]
    async fn test_catalog_management() {
        let (client, test_db) = setup_test_client(create_standard_test_db().await).await;
        let root = test_db.user_id("root");
        let admin = test_db.user_id("admin_ada");

        let response = client
            .post("/api/achievements/seed")
            .header(as_user(admin))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Forbidden);

        let response = client
            .post("/api/achievements/seed")
            .header(as_user(root))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let seeded = json_body(response).await;
        assert_eq!(seeded["inserted"], 0);

        let response = client
            .post("/api/achievements")
            .header(as_user(root))
            .header(ContentType::JSON)
            .body(
                json!({
                    "name": "Night Owl",
                    "description": "Pass a quiz",
                    "icon": "owl",
                    "kind": "course_complete",
                    "requirement": 2,
                    "points_reward": 40
                })
                .to_string(),
            )
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Created);
        let created = response.into_json::<CreatedResponse>().await.unwrap();

        let response = client
            .put(format!("/api/achievements/{}", created.id))
            .header(as_user(root))
            .header(ContentType::JSON)
            .body(json!({ "points_reward": 45 }).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let updated = json_body(response).await;
        assert_eq!(updated["points_reward"], 45);
        assert_eq!(updated["name"], "Night Owl");

        let response = client
            .get("/api/achievements")
            .header(as_user(admin))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let catalog = json_body(response).await;
        assert_eq!(catalog.as_array().unwrap().len(), 8);
    }

    #[rocket::async_test]
    async fn test_reconcile_endpoint() {
        let (client, test_db) = setup_test_client(create_standard_test_db().await).await;
        let acme = test_db.organization_id("Acme University");
        let admin = test_db.user_id("admin_ada");
        let prof = test_db.user_id("prof_plum");

        let response = client
            .post(format!("/api/organizations/{}/reconcile", acme))
            .header(as_user(prof))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Forbidden);

        let response = client
            .post(format!("/api/organizations/{}/reconcile", acme))
            .header(as_user(admin))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let summary = json_body(response).await;
        assert_eq!(summary["users_checked"], 4);
        assert_eq!(summary["failures"], 0);
    }
}

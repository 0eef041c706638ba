//! Concurrent appends to one interaction log must never drop an event

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use lamad_store::body::{LessonBody, ModuleBody};
use lamad_store::db::models::{PermissionLevel, Principal};
use lamad_store::services::EventInput;
use lamad_store::{Config, LearningDb, Services};
use serde_json::json;
use tempfile::TempDir;

fn lesson_body() -> LessonBody {
    serde_json::from_value(json!({
        "title": "Hashing",
        "chunks": [{
            "id": "c1",
            "type": "question",
            "content": [{
                "id": "q1",
                "type": "quiz",
                "question": "Average lookup cost?",
                "options": [
                    {"option": "O(1)", "isAnswer": true},
                    {"option": "O(n)", "isAnswer": false}
                ]
            }]
        }]
    }))
    .unwrap()
}

fn answer(i: usize) -> EventInput {
    EventInput::new(
        "QUIZ_ANSWER",
        json!({
            "quizId": "q1",
            "selectedOptionIndex": i % 2,
            "isCorrect": i % 2 == 0,
            "timestamp": "2024-05-01T10:00:00Z"
        }),
    )
}

/// Module + lesson the student may interact with. Returns the lesson id.
fn seed(services: &Services) -> String {
    let module = services
        .graph
        .create_module(
            ModuleBody {
                title: "Data structures".into(),
                ..Default::default()
            },
            "teacher",
        )
        .unwrap();
    let lesson = services
        .graph
        .create_lesson(&module.id, lesson_body(), "teacher")
        .unwrap();
    services
        .permissions
        .grant(&module.id, Principal::User("student".into()), PermissionLevel::Interact, "teacher", None)
        .unwrap();
    lesson.id
}

fn assert_all_recorded(services: &Services, lesson_id: &str, n: usize) {
    let log = services.interactions.get(lesson_id, "student").unwrap();
    assert_eq!(log.len(), n);

    let ids: HashSet<_> = log.events.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids.len(), n, "event ids must be distinct");
}

fn file_config(temp_dir: &TempDir) -> Config {
    Config {
        storage_dir: temp_dir.path().to_path_buf(),
        ..Default::default()
    }
}

fn record_concurrently_shared(n: usize) {
    let temp_dir = TempDir::new().unwrap();
    let config = file_config(&temp_dir);
    let db = Arc::new(LearningDb::open(&config).unwrap());
    let services = Services::new(db, &config);
    let lesson_id = seed(&services);

    thread::scope(|scope| {
        for i in 0..n {
            let services = &services;
            let lesson_id = &lesson_id;
            scope.spawn(move || {
                services
                    .interactions
                    .record(lesson_id, "student", &answer(i))
                    .unwrap();
            });
        }
    });

    assert_all_recorded(&services, &lesson_id, n);
}

/// Each worker owns its own connection, so appends race inside SQLite
/// rather than on the in-process mutex.
fn record_concurrently_separate_connections(n: usize, connections: usize) {
    let temp_dir = TempDir::new().unwrap();
    let config = file_config(&temp_dir);

    let first = Services::new(Arc::new(LearningDb::open(&config).unwrap()), &config);
    let lesson_id = seed(&first);

    let mut handles = vec![first];
    for _ in 1..connections {
        handles.push(Services::new(
            Arc::new(LearningDb::open(&config).unwrap()),
            &config,
        ));
    }

    thread::scope(|scope| {
        for i in 0..n {
            let services = &handles[i % connections];
            let lesson_id = &lesson_id;
            scope.spawn(move || {
                services
                    .interactions
                    .record(lesson_id, "student", &answer(i))
                    .unwrap();
            });
        }
    });

    assert_all_recorded(&handles[0], &lesson_id, n);
}

#[test]
fn test_no_lost_update_2() {
    record_concurrently_shared(2);
    record_concurrently_separate_connections(2, 2);
}

#[test]
fn test_no_lost_update_10() {
    record_concurrently_shared(10);
    record_concurrently_separate_connections(10, 4);
}

#[test]
fn test_no_lost_update_100() {
    record_concurrently_shared(100);
    record_concurrently_separate_connections(100, 4);
}

#[test]
fn test_in_memory_no_lost_update() {
    let db = Arc::new(LearningDb::open_in_memory().unwrap());
    let services = Services::new(db, &Config::default());
    let lesson_id = seed(&services);

    thread::scope(|scope| {
        for i in 0..50 {
            let services = &services;
            let lesson_id = &lesson_id;
            scope.spawn(move || {
                services
                    .interactions
                    .record(lesson_id, "student", &answer(i))
                    .unwrap();
            });
        }
    });

    assert_all_recorded(&services, &lesson_id, 50);
}

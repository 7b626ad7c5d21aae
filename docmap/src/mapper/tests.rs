use super::*;
use crate::document::{CREATED_AT_KEY, ID_KEY, UPDATED_AT_KEY};
use crate::encryption::{is_hashed, verify};
use crate::pipeline::JoinSpec;
use crate::schema::{parse_schema_str, FormatFn};
use crate::store::{
    DeleteResult, FindOneAndUpdateOptions, InsertManyResult, InsertOneResult, MemoryStore,
    SqliteStore, UpdateResult,
};
use crate::schema::IndexDescriptor;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Mutex;

const SCHEMA: &str = r#"
settings:
  hash_secret: pepper
entities:
  users:
    permissions: { upsert: true, update_many: true, delete_many: true }
    cascade: [posts]
    indexes:
      - { name: email_unique, keys: { email: 1 }, unique: true }
    fields:
      name: { type: string, required: true }
      email: { type: string, required: true, pattern: "^[^@]+@[^@]+$" }
      password: { type: string, encrypted: true, pattern: "^.{8,}$" }
      role: { type: string, enum: [admin, member], default: member }
      age: { type: integer, range: [0, 150] }
      address:
        type: object
        fields:
          city: { type: string }
  posts:
    permissions: { update_many: true, delete_many: true }
    fields:
      title: { type: string, required: true }
      author: { type: id, ref: users, required: true }
      tags: { type: array, items: string }
      views: { type: integer, default: 0 }
  locked:
    permissions: { insert: false, update: false, delete: false }
    fields:
      label: { type: string }
"#;

fn definition() -> SchemaDefinition {
    let mut definition = parse_schema_str(SCHEMA).unwrap();
    let email = definition
        .entity_mut("users")
        .unwrap()
        .field_mut("email")
        .unwrap();
    email.format = Some(FormatFn::new(|value| match value {
        Value::String(s) => Value::String(s.trim().to_lowercase()),
        other => other,
    }));
    definition
}

fn setup<S: DocumentStore>(store: S) -> Mapper<S> {
    Mapper::from_definition(store, definition()).unwrap()
}

fn setup_memory() -> Mapper<MemoryStore> {
    setup(MemoryStore::new())
}

fn insert_user<S: DocumentStore>(mapper: &Mapper<S>, name: &str, email: &str) -> Map {
    mapper
        .model("users")
        .unwrap()
        .insert_one(json!({ "name": name, "email": email }), InsertOptions::default())
        .unwrap()
}

fn insert_post<S: DocumentStore>(mapper: &Mapper<S>, title: &str, author: &Map) -> Map {
    mapper
        .model("posts")
        .unwrap()
        .insert_one(
            json!({ "title": title, "author": author[ID_KEY] }),
            InsertOptions::default(),
        )
        .unwrap()
}

#[test]
fn test_insert_prepares_document() {
    let mapper = setup_memory();
    let users = mapper.model("users").unwrap();
    let doc = users
        .insert_one(
            json!({ "name": "Alice", "email": "  Alice@Example.COM ", "extra": 1 }),
            InsertOptions::default(),
        )
        .unwrap();

    assert!(DocumentId::of(&doc).is_some());
    assert_eq!(doc["email"], json!("alice@example.com"));
    assert_eq!(doc["role"], json!("member"));
    assert!(doc.get("extra").is_none());
    assert!(doc.contains_key(CREATED_AT_KEY));
    assert_eq!(doc[CREATED_AT_KEY], doc[UPDATED_AT_KEY]);
    assert_eq!(doc.keys().next().map(String::as_str), Some(ID_KEY));

    let id = DocumentId::of(&doc).unwrap();
    assert_eq!(users.find_by_id(&id).unwrap(), Some(doc));
}

#[test]
fn test_insert_without_timestamps() {
    let mapper = setup_memory();
    let doc = mapper
        .model("users")
        .unwrap()
        .insert_one(
            json!({ "name": "A", "email": "a@x.io" }),
            InsertOptions { timestamps: false },
        )
        .unwrap();
    assert!(!doc.contains_key(CREATED_AT_KEY));
    assert!(!doc.contains_key(UPDATED_AT_KEY));
}

#[test]
fn test_missing_required_field_writes_nothing() {
    let mapper = setup_memory();
    let result = mapper
        .model("users")
        .unwrap()
        .insert_one(json!({ "email": "a@x.io" }), InsertOptions::default());
    assert!(matches!(result, Err(DocmapError::Validation(_))));
    assert_eq!(mapper.store().len("users").unwrap(), 0);
}

#[test]
fn test_invalid_values_rejected() {
    let mapper = setup_memory();
    let users = mapper.model("users").unwrap();
    for doc in [
        json!({ "name": "A", "email": "not-an-email" }),
        json!({ "name": "A", "email": "a@x.io", "age": 151 }),
        json!({ "name": "A", "email": "a@x.io", "role": "owner" }),
        json!({ "name": 5, "email": "a@x.io" }),
        json!({ "name": "A", "email": "a@x.io", "_id": "nope" }),
    ] {
        let result = users.insert_one(doc.clone(), InsertOptions::default());
        assert!(matches!(result, Err(DocmapError::Validation(_))), "accepted {doc}");
    }
    assert_eq!(users.count(&Value::Null).unwrap(), 0);
}

#[test]
fn test_encrypted_field_never_stored_in_plaintext() {
    let mapper = setup_memory();
    let users = mapper.model("users").unwrap();
    let doc = users
        .insert_one(
            json!({ "name": "A", "email": "a@x.io", "password": "correct horse" }),
            InsertOptions::default(),
        )
        .unwrap();

    let stored = mapper.store().find("users", &Map::new()).unwrap().remove(0);
    assert_eq!(stored, doc);
    assert_ne!(stored["password"], json!("correct horse"));
    assert!(is_hashed(&stored["password"]));
    assert!(verify(&json!("correct horse"), &stored["password"], "pepper"));

    // The hashed form is not hashed again
    let id = DocumentId::of(&doc).unwrap();
    users
        .update_one(
            Value::from(id),
            json!({ "password": stored["password"].clone() }),
            UpdateOptions::default(),
        )
        .unwrap();
    let again = users.find_by_id(&id).unwrap().unwrap();
    assert_eq!(again["password"], stored["password"]);

    // Plaintext is validated before hashing
    let short = users.insert_one(
        json!({ "name": "B", "email": "b@x.io", "password": "short" }),
        InsertOptions::default(),
    );
    assert!(matches!(short, Err(DocmapError::Validation(_))));
}

#[test]
fn test_encrypted_field_hashed_through_every_operator() {
    let mapper = setup_memory();
    let users = mapper.model("users").unwrap();

    users
        .update_one(
            json!({ "email": "p@x.io" }),
            json!({ "$set": { "name": "P" }, "$setOnInsert": { "password": "hunter2222" } }),
            UpdateOptions::upsert(),
        )
        .unwrap();
    let stored = mapper.store().find("users", &Map::new()).unwrap().remove(0);
    assert!(is_hashed(&stored["password"]));
    assert!(verify(&json!("hunter2222"), &stored["password"], "pepper"));

    let id = DocumentId::of(&stored).unwrap();
    for update in [
        json!({ "$max": { "password": "zzzzzzzzzz" } }),
        json!({ "$min": { "password": "aaaaaaaaaa" } }),
        json!({ "$push": { "password": "x" } }),
    ] {
        let result = users.update_one(Value::from(id), update.clone(), UpdateOptions::default());
        assert!(matches!(result, Err(DocmapError::InvalidUpdate(_))), "accepted {update}");
    }
    let after = mapper.store().find("users", &Map::new()).unwrap().remove(0);
    assert_eq!(after["password"], stored["password"]);

    // Plaintext in $setOnInsert is validated before hashing
    let short = users.update_one(
        json!({ "email": "q@x.io" }),
        json!({ "$set": { "name": "Q" }, "$setOnInsert": { "password": "short" } }),
        UpdateOptions::upsert(),
    );
    assert!(matches!(short, Err(DocmapError::Validation(_))));
}

#[test]
fn test_update_operators_are_validated() {
    let mapper = setup_memory();
    let users = mapper.model("users").unwrap();
    let doc = insert_user(&mapper, "A", "a@x.io");
    let id = Value::from(DocumentId::of(&doc).unwrap());
    let age = || users.find_one(&id).unwrap().unwrap().get("age").cloned();

    for update in [
        json!({ "$inc": { "age": 1000 } }),
        json!({ "$inc": { "name": 1 } }),
        json!({ "$max": { "age": 500 } }),
        json!({ "$min": { "age": -1 } }),
        json!({ "$unset": { "name": "" } }),
    ] {
        let result = users.update_one(id.clone(), update.clone(), UpdateOptions::default());
        assert!(matches!(result, Err(DocmapError::Validation(_))), "accepted {update}");
    }
    assert_eq!(age(), None);

    assert!(users.update_one(id.clone(), json!({ "$inc": { "age": 30 } }), UpdateOptions::default()).unwrap());
    assert_eq!(age(), Some(json!(30)));
    // In range alone, out of range once added to the stored value
    let over = users.update_one(id.clone(), json!({ "$inc": { "age": 130 } }), UpdateOptions::default());
    assert!(matches!(over, Err(DocmapError::Validation(_))));
    assert_eq!(age(), Some(json!(30)));

    assert!(users.update_one(id.clone(), json!({ "$unset": { "age": "" } }), UpdateOptions::default()).unwrap());
    assert_eq!(age(), None);

    let seeded = users.update_one(
        json!({ "email": "n@x.io" }),
        json!({ "$setOnInsert": { "name": "N", "age": 999 } }),
        UpdateOptions::upsert(),
    );
    assert!(matches!(seeded, Err(DocmapError::Validation(_))));
    assert_eq!(users.count(&Value::Null).unwrap(), 1);

    // $setOnInsert counts toward the required fields of an upsert
    users
        .update_one(
            json!({ "email": "n@x.io" }),
            json!({ "$setOnInsert": { "name": "N" } }),
            UpdateOptions::upsert(),
        )
        .unwrap();
    assert_eq!(users.count(&Value::Null).unwrap(), 2);
}

#[test]
fn test_array_operators_check_items() {
    let mapper = setup_memory();
    let author = insert_user(&mapper, "A", "a@x.io");
    let post = insert_post(&mapper, "Hello", &author);
    let posts = mapper.model("posts").unwrap();
    let id = Value::from(DocumentId::of(&post).unwrap());

    for update in [
        json!({ "$push": { "tags": 5 } }),
        json!({ "$push": { "tags": { "$each": ["a", 3] } } }),
        json!({ "$addToSet": { "title": "x" } }),
    ] {
        let result = posts.update_one(id.clone(), update.clone(), UpdateOptions::default());
        assert!(matches!(result, Err(DocmapError::Validation(_))), "accepted {update}");
    }

    posts
        .update_one(
            id.clone(),
            json!({ "$addToSet": { "tags": { "$each": ["a", "b", "a"] } } }),
            UpdateOptions::default(),
        )
        .unwrap();
    let doc = posts.find_one(&id).unwrap().unwrap();
    assert_eq!(doc["tags"], json!(["a", "b"]));
}

#[test]
fn test_unique_index_precheck() {
    let mapper = setup_memory();
    let users = mapper.model("users").unwrap();
    insert_user(&mapper, "A", "a@x.io");
    let dup = users.insert_one(json!({ "name": "B", "email": "A@x.io" }), InsertOptions::default());
    assert!(matches!(dup, Err(DocmapError::Validation(_))));

    let batch = users.insert_many(
        vec![
            json!({ "name": "C", "email": "c@x.io" }),
            json!({ "name": "D", "email": "c@x.io" }),
        ],
        InsertOptions::default(),
    );
    assert!(matches!(batch, Err(DocmapError::Validation(_))));
    assert_eq!(users.count(&Value::Null).unwrap(), 1);
}

#[test]
fn test_insert_many_in_order() {
    let mapper = setup_memory();
    let users = mapper.model("users").unwrap();
    let docs = users
        .insert_many(
            vec![
                json!({ "name": "A", "email": "a@x.io" }),
                json!({ "name": "B", "email": "b@x.io" }),
            ],
            InsertOptions::default(),
        )
        .unwrap();
    let names: Vec<&Value> = docs.iter().map(|doc| &doc["name"]).collect();
    assert_eq!(names, vec![&json!("A"), &json!("B")]);
    assert!(users.insert_many(vec![], InsertOptions::default()).unwrap().is_empty());
}

#[test]
fn test_permissions_are_preflight() {
    let mapper = setup_memory();
    let locked = mapper.model("locked").unwrap();
    let err = locked
        .insert_one(json!({ "label": "x" }), InsertOptions::default())
        .unwrap_err();
    assert!(err.is_preflight());
    assert!(matches!(
        locked.update_one(Value::Null, json!({ "label": "y" }), UpdateOptions::default()),
        Err(DocmapError::Permission { .. })
    ));
    assert!(matches!(
        locked.delete_one(Value::Null),
        Err(DocmapError::Permission { .. })
    ));

    let posts = mapper.model("posts").unwrap();
    let upsert = posts.update_one(json!({ "title": "x" }), json!({ "views": 1 }), UpdateOptions::upsert());
    assert!(matches!(upsert, Err(DocmapError::Permission { .. })));
}

#[test]
fn test_update_one_reports_match() {
    let mapper = setup_memory();
    let users = mapper.model("users").unwrap();
    let alice = insert_user(&mapper, "Alice", "alice@x.io");

    let updated = users
        .update_one(
            json!({ "email": "alice@x.io" }),
            json!({ "age": 31, "unknown": true }),
            UpdateOptions::default(),
        )
        .unwrap();
    assert!(updated);
    let doc = users.find_one(&json!({ "email": "alice@x.io" })).unwrap().unwrap();
    assert_eq!(doc["age"], json!(31));
    assert!(doc.get("unknown").is_none());
    assert_eq!(doc[CREATED_AT_KEY], alice[CREATED_AT_KEY]);

    let missing = users
        .update_one(json!({ "email": "nobody@x.io" }), json!({ "age": 1 }), UpdateOptions::default())
        .unwrap();
    assert!(!missing);

    let invalid = users.update_one(json!({ "email": "alice@x.io" }), json!({ "age": 200 }), UpdateOptions::default());
    assert!(matches!(invalid, Err(DocmapError::Validation(_))));
    let unset_required = users.update_one(
        json!({ "email": "alice@x.io" }),
        json!({ "$set": { "name": null } }),
        UpdateOptions::default(),
    );
    assert!(matches!(unset_required, Err(DocmapError::Validation(_))));
}

#[test]
fn test_update_formats_set_values() {
    let mapper = setup_memory();
    let users = mapper.model("users").unwrap();
    insert_user(&mapper, "Alice", "alice@x.io");
    users
        .update_one(
            json!({ "name": "Alice" }),
            json!({ "$set": { "email": " ALICE@new.io " }, "$inc": { "age": 2 } }),
            UpdateOptions::default(),
        )
        .unwrap();
    let doc = users.find_one(&json!({ "name": "Alice" })).unwrap().unwrap();
    assert_eq!(doc["email"], json!("alice@new.io"));
    assert_eq!(doc["age"], json!(2));
}

#[test]
fn test_upsert_creates_one_document_from_filter() {
    let mapper = setup_memory();
    let users = mapper.model("users").unwrap();

    let filter = json!({ "email": "new@x.io", "name": "New" });
    let created = users
        .update_one(filter.clone(), json!({ "$set": { "age": 5 } }), UpdateOptions::upsert())
        .unwrap();
    assert!(created);
    assert_eq!(users.count(&Value::Null).unwrap(), 1);

    let doc = users.find_one(&filter).unwrap().unwrap();
    assert!(DocumentId::of(&doc).is_some());
    assert_eq!(doc["name"], json!("New"));
    assert_eq!(doc["age"], json!(5));
    assert_eq!(doc["role"], json!("member"));
    assert!(doc.contains_key(CREATED_AT_KEY));

    users
        .update_one(filter.clone(), json!({ "$set": { "age": 6 } }), UpdateOptions::upsert())
        .unwrap();
    assert_eq!(users.count(&Value::Null).unwrap(), 1);
    assert_eq!(users.find_one(&filter).unwrap().unwrap()["age"], json!(6));
}

#[test]
fn test_upsert_set_wins_over_filter() {
    let mapper = setup_memory();
    let users = mapper.model("users").unwrap();
    let doc = users
        .find_one_and_update(
            json!({ "email": "u@x.io" }),
            json!({ "$set": { "name": "From set", "address.city": "Oslo" } }),
            UpdateOptions::upsert(),
        )
        .unwrap()
        .unwrap();
    assert_eq!(doc["name"], json!("From set"));
    assert_eq!(doc["email"], json!("u@x.io"));
    assert_eq!(doc["address"], json!({ "city": "Oslo" }));
}

#[test]
fn test_upsert_requires_required_fields() {
    let mapper = setup_memory();
    let users = mapper.model("users").unwrap();
    let result = users.update_one(json!({ "email": "x@y.io" }), json!({ "age": 3 }), UpdateOptions::upsert());
    assert!(matches!(result, Err(DocmapError::Validation(_))));
    assert_eq!(users.count(&Value::Null).unwrap(), 0);
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
    previous: Mutex<Vec<Option<Map>>>,
    updated: Mutex<Vec<Map>>,
}

impl Recorder {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

struct RecordingHooks(Arc<Recorder>);

impl Hooks for RecordingHooks {
    fn pre_insert(&self, mut doc: Value) -> Result<Value> {
        self.0.events.lock().unwrap().push("pre_insert".into());
        if let Some(title) = doc.get("title").and_then(Value::as_str).map(str::to_string) {
            doc["title"] = Value::String(title.trim().to_string());
        }
        Ok(doc)
    }

    fn post_insert(&self, doc: &Map) -> Result<()> {
        self.0.events.lock().unwrap().push(format!("post_insert {}", doc["title"]));
        Ok(())
    }

    fn pre_update(&self, filter: Value, update: Value) -> Result<(Value, Value)> {
        self.0.events.lock().unwrap().push("pre_update".into());
        Ok((filter, update))
    }

    fn post_update(&self, previous: Option<&Map>, documents: &[Map]) -> Result<()> {
        self.0.events.lock().unwrap().push("post_update".into());
        self.0.previous.lock().unwrap().push(previous.cloned());
        self.0.updated.lock().unwrap().extend(documents.iter().cloned());
        Ok(())
    }

    fn pre_delete(&self, filter: Value) -> Result<Value> {
        self.0.events.lock().unwrap().push("pre_delete".into());
        Ok(filter)
    }

    fn post_delete(&self, deleted: &[Map]) -> Result<()> {
        self.0.events.lock().unwrap().push(format!("post_delete {}", deleted.len()));
        Ok(())
    }
}

fn setup_with_recorder() -> (Mapper<MemoryStore>, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let mapper = setup_memory()
        .with_hooks("posts", RecordingHooks(recorder.clone()))
        .unwrap();
    (mapper, recorder)
}

#[test]
fn test_hooks_wrap_insert() {
    let (mapper, recorder) = setup_with_recorder();
    let author = insert_user(&mapper, "A", "a@x.io");
    let post = insert_post(&mapper, "  Hello  ", &author);
    assert_eq!(post["title"], json!("Hello"));
    assert_eq!(post["views"], json!(0));
    assert_eq!(recorder.events(), vec!["pre_insert", "post_insert \"Hello\""]);
}

#[test]
fn test_find_one_and_update_passes_previous_to_hook() {
    let (mapper, recorder) = setup_with_recorder();
    let author = insert_user(&mapper, "A", "a@x.io");
    insert_post(&mapper, "Hello", &author);
    let posts = mapper.model("posts").unwrap();

    let after = posts
        .find_one_and_update(json!({ "title": "Hello" }), json!({ "views": 7 }), UpdateOptions::default())
        .unwrap()
        .unwrap();
    assert_eq!(after["views"], json!(7));

    let previous = recorder.previous.lock().unwrap().clone();
    assert_eq!(previous.len(), 1);
    assert_eq!(previous[0].as_ref().unwrap()["views"], json!(0));
    assert_eq!(recorder.updated.lock().unwrap().clone(), vec![after]);

    let none = posts
        .find_one_and_update(json!({ "title": "Nope" }), json!({ "views": 1 }), UpdateOptions::default())
        .unwrap();
    assert!(none.is_none());
}

#[test]
fn test_update_many_variants() {
    let (mapper, recorder) = setup_with_recorder();
    let author = insert_user(&mapper, "A", "a@x.io");
    for title in ["one", "two", "three"] {
        insert_post(&mapper, title, &author);
    }
    let posts = mapper.model("posts").unwrap();
    let query = json!({ "author": author[ID_KEY] });

    let modified = posts.update_many(query.clone(), json!({ "views": 1 }), UpdateOptions::default()).unwrap();
    assert_eq!(modified, 3);

    let updated = posts
        .update_many_returning(query.clone(), json!({ "$inc": { "views": 2 } }), UpdateOptions::default())
        .unwrap();
    assert_eq!(updated.len(), 3);
    assert!(updated.iter().all(|doc| doc["views"] == json!(3)));
    assert_eq!(recorder.updated.lock().unwrap().len(), 3);

    let none = posts
        .update_many_returning(json!({ "title": "zzz" }), json!({ "views": 9 }), UpdateOptions::default())
        .unwrap();
    assert!(none.is_empty());
}

#[test]
fn test_update_many_requires_permission() {
    let mapper = setup_memory();
    let locked = mapper.model("locked").unwrap();
    let result = locked.update_many(Value::Null, json!({ "label": "x" }), UpdateOptions::default());
    assert!(matches!(result, Err(DocmapError::Permission { .. })));
}

#[test]
fn test_cascade_delete_removes_dependents() {
    let (mapper, recorder) = setup_with_recorder();
    let alice = insert_user(&mapper, "Alice", "alice@x.io");
    let bob = insert_user(&mapper, "Bob", "bob@x.io");
    insert_post(&mapper, "a1", &alice);
    insert_post(&mapper, "a2", &alice);
    insert_post(&mapper, "b1", &bob);

    let users = mapper.model("users").unwrap();
    let posts = mapper.model("posts").unwrap();
    let id = DocumentId::of(&alice).unwrap();
    assert!(users.delete_one(Value::from(id)).unwrap());

    assert_eq!(posts.count(&json!({ "author": id.to_string() })).unwrap(), 0);
    let remaining = posts.find_many(&Value::Null, FindOptions::default()).unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0]["title"], json!("b1"));
    // The cascade runs through the dependent's own delete path
    assert!(recorder.events().contains(&"pre_delete".to_string()));
}

#[test]
fn test_delete_variants_and_zero_matches() {
    let mapper = setup_memory();
    let users = mapper.model("users").unwrap();
    insert_user(&mapper, "A", "a@x.io");
    insert_user(&mapper, "B", "b@x.io");
    insert_user(&mapper, "C", "c@x.io");

    let taken = users.find_one_and_delete(json!({ "name": "A" })).unwrap().unwrap();
    assert_eq!(taken["email"], json!("a@x.io"));
    assert!(users.find_one_and_delete(json!({ "name": "A" })).unwrap().is_none());
    assert!(!users.delete_one(json!({ "name": "A" })).unwrap());

    let deleted = users
        .delete_many_returning(json!({ "name": { "$in": ["B", "C"] } }))
        .unwrap();
    assert_eq!(deleted.len(), 2);
    assert_eq!(users.delete_many(Value::Null).unwrap(), 0);
}

#[test]
fn test_delete_many_without_cascade_counts() {
    let mapper = setup_memory();
    let author = insert_user(&mapper, "A", "a@x.io");
    for title in ["x", "y"] {
        insert_post(&mapper, title, &author);
    }
    let posts = mapper.model("posts").unwrap();
    assert_eq!(posts.delete_many(json!({ "author": author[ID_KEY] })).unwrap(), 2);
}

#[test]
fn test_count_matches_find_many() {
    let mapper = setup_memory();
    let users = mapper.model("users").unwrap();
    for (name, email) in [("A", "a@x.io"), ("B", "b@x.io"), ("C", "c@x.io")] {
        insert_user(&mapper, name, email);
    }
    users
        .update_one(json!({ "name": "B" }), json!({ "role": "admin" }), UpdateOptions::default())
        .unwrap();

    for query in [
        Value::Null,
        json!({}),
        json!({ "role": "admin" }),
        json!({ "role": { "$ne": "admin" } }),
        json!({ "name": "Z" }),
        json!({ "$or": [ { "name": "A" }, { "name": "C" } ] }),
        json!({ "bogus": 1 }),
    ] {
        let found = users.find_many(&query, FindOptions::default()).unwrap();
        assert_eq!(users.count(&query).unwrap(), found.len() as u64, "query {query}");
    }
}

#[test]
fn test_query_by_id_and_string_form_agree() {
    let mapper = setup_memory();
    let users = mapper.model("users").unwrap();
    let doc = insert_user(&mapper, "A", "a@x.io");
    let id = DocumentId::of(&doc).unwrap();
    let by_id = users.find_one(&Value::from(id)).unwrap();
    let by_string = users.find_one(&json!(id.to_string().to_uppercase())).unwrap();
    assert_eq!(by_id, by_string);
    assert_eq!(by_id, Some(doc));
}

#[test]
fn test_find_many_sort_skip_limit() {
    let mapper = setup_memory();
    let users = mapper.model("users").unwrap();
    for (name, email) in [("B", "b@x.io"), ("C", "c@x.io"), ("A", "a@x.io")] {
        insert_user(&mapper, name, email);
    }
    let options = FindOptions {
        sort: Some(json!({ "name": 1 }).as_object().cloned().unwrap()),
        skip: Some(1),
        limit: Some(1),
    };
    let found = users.find_many(&Value::Null, options).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0]["name"], json!("B"));
}

#[test]
fn test_aggregate_populates_references() {
    let mapper = setup_memory();
    let alice = insert_user(&mapper, "Alice", "alice@x.io");
    let bob = insert_user(&mapper, "Bob", "bob@x.io");
    insert_post(&mapper, "by alice", &alice);
    insert_post(&mapper, "by bob", &bob);

    let posts = mapper.model("posts").unwrap();
    let docs = posts
        .aggregate(
            &json!({ "join": { "author": true }, "postFilter": { "author.name": "Alice" } }),
            &PipelineOptions::default(),
        )
        .unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0]["title"], json!("by alice"));
    assert_eq!(docs[0]["author"]["email"], json!("alice@x.io"));

    // A plain query is used as the filter
    let stages = posts.pipeline(&json!({ "title": "by bob" }), &PipelineOptions::default()).unwrap();
    assert_eq!(stages.len(), 1);

    let grouped = posts
        .aggregate(&json!({ "group": "author", "sort": { "_id": 1 } }), &PipelineOptions::default())
        .unwrap();
    assert_eq!(grouped.len(), 2);

    let project = posts
        .project(&ProjectOptions {
            exclude: vec!["author.password".to_string()],
            populate: Some(JoinSpec::new().populate("author")),
        })
        .unwrap();
    let projected = mapper
        .store()
        .aggregate(
            "posts",
            &[
                posts.pipeline(&json!({ "join": { "author": true } }), &PipelineOptions::default()).unwrap(),
                vec![project],
            ]
            .concat(),
        )
        .unwrap();
    assert!(projected[0]["author"].get("password").is_none());
    assert_eq!(projected[0]["author"]["name"], alice["name"]);
}

#[test]
fn test_malformed_pipeline_is_configuration_error() {
    let mapper = setup_memory();
    let posts = mapper.model("posts").unwrap();
    let result = posts.aggregate(&json!({ "join": { "title": true } }), &PipelineOptions::default());
    assert!(matches!(result, Err(DocmapError::Configuration(_))));
    let result = posts.pipeline(&json!({ "join": "author" }), &PipelineOptions::default());
    assert!(matches!(result, Err(DocmapError::Configuration(_))));
}

#[test]
fn test_random_fields() {
    let mapper = setup_memory();
    let users = mapper.model("users").unwrap();

    let required = users.random_fields(&Value::Null, RandomOptions::default()).unwrap();
    let keys: Vec<&str> = required.keys().map(String::as_str).collect();
    assert_eq!(keys, vec!["name", "email"]);

    let full = users
        .random_fields(
            &json!({ "email": "fixed@x.io", "junk": 1 }),
            RandomOptions { include_optionals: true },
        )
        .unwrap();
    assert_eq!(full["email"], json!("fixed@x.io"));
    assert_eq!(full["role"], json!("member"));
    assert!(full.get("junk").is_none());
    let age = full["age"].as_i64().unwrap();
    assert!((0..=150).contains(&age));

    // Nothing persisted, but the generated document is insertable
    assert_eq!(users.count(&Value::Null).unwrap(), 0);
    users.insert_one(Value::Object(full), InsertOptions::default()).unwrap();
}

#[test]
fn test_mapper_construction_checks() {
    let store = MemoryStore::new();
    store.close().unwrap();
    let result = Mapper::from_definition(store, definition());
    assert!(matches!(result, Err(DocmapError::StoreFailure(_))));

    let broken = parse_schema_str(
        "entities:\n  posts:\n    fields:\n      author: { type: id, ref: ghosts }\n",
    )
    .unwrap();
    let result = Mapper::from_definition(MemoryStore::new(), broken);
    assert!(matches!(result, Err(DocmapError::Configuration(_))));

    let mapper = setup_memory();
    assert!(mapper.model("ghosts").is_err());
    assert!(mapper.with_hooks("ghosts", NoHooks).is_err());
}

#[test]
fn test_model_for_collection_and_close() {
    let mapper = setup_memory();
    assert_eq!(mapper.model_for_collection("users").unwrap().schema().name, "users");
    mapper.close().unwrap();
    assert!(!mapper.store().is_ready());
    let result = mapper.model("users").unwrap().count(&Value::Null);
    assert!(matches!(result, Err(DocmapError::StoreFailure(_))));
}

#[test]
fn test_lifecycle_over_sqlite() {
    let mapper = setup(SqliteStore::open_in_memory().unwrap());
    let alice = insert_user(&mapper, "Alice", "alice@x.io");
    insert_post(&mapper, "a1", &alice);

    let users = mapper.model("users").unwrap();
    let dup = users.insert_one(json!({ "name": "B", "email": "alice@x.io" }), InsertOptions::default());
    assert!(matches!(dup, Err(DocmapError::Validation(_))));

    assert!(users.delete_one(Value::from(DocumentId::of(&alice).unwrap())).unwrap());
    assert_eq!(mapper.model("posts").unwrap().count(&Value::Null).unwrap(), 0);
}

/// A store that accepts writes but never acknowledges inserts.
struct UnacknowledgedStore(MemoryStore);

impl DocumentStore for UnacknowledgedStore {
    fn is_ready(&self) -> bool {
        self.0.is_ready()
    }

    fn close(&self) -> Result<()> {
        self.0.close()
    }

    fn ensure_indexes(&self, collection: &str, indexes: &[IndexDescriptor]) -> Result<()> {
        self.0.ensure_indexes(collection, indexes)
    }

    fn aggregate(&self, collection: &str, stages: &[Stage]) -> Result<Vec<Map>> {
        self.0.aggregate(collection, stages)
    }

    fn insert_one(&self, collection: &str, doc: Map) -> Result<InsertOneResult> {
        let result = self.0.insert_one(collection, doc)?;
        Ok(InsertOneResult {
            acknowledged: false,
            ..result
        })
    }

    fn insert_many(&self, collection: &str, docs: Vec<Map>) -> Result<InsertManyResult> {
        self.0.insert_many(collection, docs)
    }

    fn update_one(&self, collection: &str, filter: &Map, update: &Map, upsert: bool) -> Result<UpdateResult> {
        self.0.update_one(collection, filter, update, upsert)
    }

    fn update_many(&self, collection: &str, filter: &Map, update: &Map, upsert: bool) -> Result<UpdateResult> {
        self.0.update_many(collection, filter, update, upsert)
    }

    fn delete_one(&self, collection: &str, filter: &Map) -> Result<DeleteResult> {
        self.0.delete_one(collection, filter)
    }

    fn delete_many(&self, collection: &str, filter: &Map) -> Result<DeleteResult> {
        self.0.delete_many(collection, filter)
    }

    fn find_one_and_update(
        &self,
        collection: &str,
        filter: &Map,
        update: &Map,
        options: FindOneAndUpdateOptions,
    ) -> Result<Option<Map>> {
        self.0.find_one_and_update(collection, filter, update, options)
    }

    fn find_one_and_delete(&self, collection: &str, filter: &Map) -> Result<Option<Map>> {
        self.0.find_one_and_delete(collection, filter)
    }
}

#[test]
fn test_unacknowledged_write_is_store_failure() {
    let (recorder, mapper) = {
        let recorder = Arc::new(Recorder::default());
        let mapper = setup(UnacknowledgedStore(MemoryStore::new()))
            .with_hooks("users", RecordingHooks(recorder.clone()))
            .unwrap();
        (recorder, mapper)
    };
    let result = mapper
        .model("users")
        .unwrap()
        .insert_one(json!({ "name": "A", "email": "a@x.io" }), InsertOptions::default());
    assert!(matches!(result, Err(DocmapError::StoreFailure(_))));
    // post_insert never ran
    assert_eq!(recorder.events(), vec!["pre_insert"]);
}

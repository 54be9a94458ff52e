use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use rollcall_core::{
    AttendanceRecord, Candidate, CatalogError, CourseCatalog, CourseCode, CourseStats, Decision,
    Detection, Embedding, EmbeddingProvider, IndexEntry, IndexError, InvalidRollNumber,
    MatchAction, MatchResult, Matcher, ProviderError, RecordOutcome, RollNumber, Student,
    ThresholdMatcher, VectorIndex,
};
use rollcall_store::{AttendanceLedger, DailySummary, Database, IdentityStore, NewStudent, StoreError};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("unknown course: {0}")]
    UnknownCourse(CourseCode),
    #[error(transparent)]
    InvalidRollNumber(#[from] InvalidRollNumber),
    #[error("student {roll} is already registered in course {course}")]
    DuplicateIdentity { course: CourseCode, roll: RollNumber },
    #[error("student {roll} not found in course {course}")]
    NotFound { course: CourseCode, roll: RollNumber },
    #[error("no face detected")]
    NoFaceDetected,
    #[error("registration needs exactly one face, found {0}")]
    MultipleFacesAmbiguous(usize),
    #[error("invalid embedding: {0}")]
    InvalidEmbedding(String),
    #[error("index for course {0} is unavailable")]
    IndexUnavailable(CourseCode),
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("storage failure: {0}")]
    StorageFailure(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("embedding provider: {0}")]
    Provider(#[from] ProviderError),
    #[error("misconfigured: {0}")]
    Misconfigured(String),
    #[error("worker task failed: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stable name of the error kind, used as the D-Bus error prefix.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownCourse(_) => "UnknownCourse",
            Self::InvalidRollNumber(_) => "InvalidRollNumber",
            Self::DuplicateIdentity { .. } => "DuplicateIdentity",
            Self::NotFound { .. } => "NotFound",
            Self::NoFaceDetected => "NoFaceDetected",
            Self::MultipleFacesAmbiguous(_) => "MultipleFacesAmbiguous",
            Self::InvalidEmbedding(_) => "InvalidEmbedding",
            Self::IndexUnavailable(_) => "IndexUnavailable",
            Self::Timeout(_) => "Timeout",
            Self::StorageFailure(_) => "StorageFailure",
            Self::InvalidInput(_) => "InvalidInput",
            Self::Provider(_) => "ProviderFailure",
            Self::Misconfigured(_) => "Misconfigured",
            Self::Internal(_) => "Internal",
        }
    }

    /// Whether the caller may simply try again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::IndexUnavailable(_) | Self::StorageFailure(_)
        )
    }

    /// Errors caused by the request rather than by the daemon.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownCourse(_)
                | Self::InvalidRollNumber(_)
                | Self::DuplicateIdentity { .. }
                | Self::NotFound { .. }
                | Self::NoFaceDetected
                | Self::MultipleFacesAmbiguous(_)
                | Self::InvalidEmbedding(_)
                | Self::InvalidInput(_)
        )
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DuplicateIdentity { course, roll } => Self::DuplicateIdentity { course, roll },
            StoreError::NotFound { course, roll } => Self::NotFound { course, roll },
            StoreError::InvalidInput(msg) => Self::InvalidInput(msg),
            other => Self::StorageFailure(other.to_string()),
        }
    }
}

impl From<IndexError> for EngineError {
    fn from(e: IndexError) -> Self {
        match e {
            IndexError::IndexUnavailable(course) => Self::IndexUnavailable(course),
            other => Self::InvalidEmbedding(other.to_string()),
        }
    }
}

impl From<CatalogError> for EngineError {
    fn from(e: CatalogError) -> Self {
        match e {
            CatalogError::UnknownCourse(course) => Self::UnknownCourse(course),
            other => Self::Misconfigured(other.to_string()),
        }
    }
}

/// Runtime knobs of the engine, derived from `Config`.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub matcher: ThresholdMatcher,
    pub embedding_dim: usize,
    pub model_version: String,
    pub top_k: usize,
    pub institution_offset: FixedOffset,
    pub embed_timeout: Duration,
    pub query_timeout: Duration,
    pub storage_retry_backoff: Duration,
}

/// All faces of one uploaded photo.
#[derive(Debug, Clone, Serialize)]
pub struct PhotoReport {
    pub batch_id: Uuid,
    pub course: CourseCode,
    pub results: Vec<MatchResult>,
}

impl PhotoReport {
    pub fn recorded(&self) -> usize {
        self.results.iter().filter(|r| r.is_recorded()).count()
    }
}

/// Student as listed to clients, without the embedding.
#[derive(Debug, Clone, Serialize)]
pub struct StudentInfo {
    pub course: CourseCode,
    pub roll: RollNumber,
    pub name: String,
    pub active: bool,
    pub model_version: String,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Student> for StudentInfo {
    fn from(s: Student) -> Self {
        Self {
            course: s.course,
            roll: s.roll,
            name: s.name,
            active: s.active,
            model_version: s.embedding.model_version,
            registered_at: s.registered_at,
            updated_at: s.updated_at,
        }
    }
}

/// Fewest candidates requested per face; the ambiguity check needs the
/// runner-up.
const MIN_CANDIDATES: usize = 2;

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Orchestrates embedding, index lookup, decision and ledger writes.
///
/// Identity writes (register, re-register, deactivate, rebuild) hold
/// `writes` across the store commit and the index update, and run both in
/// one blocking task, so a cancelled request cannot leave the index
/// disagreeing with the identity store.
pub struct MatchEngine {
    catalog: CourseCatalog,
    provider: Arc<dyn EmbeddingProvider>,
    index: Arc<VectorIndex>,
    identities: IdentityStore,
    ledger: AttendanceLedger,
    settings: EngineSettings,
    writes: Arc<Mutex<()>>,
    clock: Clock,
    #[cfg(test)]
    ledger_attempts: std::sync::atomic::AtomicUsize,
}

impl MatchEngine {
    /// Fails if the provider's model does not match the configured
    /// dimension and version.
    pub fn new(
        catalog: CourseCatalog,
        provider: Arc<dyn EmbeddingProvider>,
        db: &Database,
        settings: EngineSettings,
    ) -> Result<Self, EngineError> {
        if provider.dimension() != settings.embedding_dim {
            return Err(EngineError::Misconfigured(format!(
                "embedding model outputs {} dimensions, configured for {}",
                provider.dimension(),
                settings.embedding_dim
            )));
        }
        if provider.model_version() != settings.model_version {
            return Err(EngineError::Misconfigured(format!(
                "embedding model version {} differs from configured {}",
                provider.model_version(),
                settings.model_version
            )));
        }

        Ok(Self {
            index: Arc::new(VectorIndex::new(
                settings.embedding_dim,
                settings.model_version.clone(),
            )),
            identities: db.identities(),
            ledger: db.ledger(settings.institution_offset),
            catalog,
            provider,
            settings,
            writes: Arc::new(Mutex::new(())),
            clock: Arc::new(Utc::now),
            #[cfg(test)]
            ledger_attempts: Default::default(),
        })
    }

    /// Replace the wall clock used to timestamp detections.
    #[cfg(test)]
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Today in the institution's time zone.
    pub fn today(&self) -> NaiveDate {
        self.ledger.day_of((self.clock)())
    }

    // --- Identity writes ---

    /// Enroll a student from a photo containing exactly one face.
    pub async fn register(
        &self,
        course: &str,
        roll: &str,
        name: &str,
        image: Vec<u8>,
    ) -> Result<Student, EngineError> {
        let (new, entry) = self.prepare_student(course, roll, name, image).await?;
        let result = self.commit_identity(new, entry, false).await;
        if let Err(e) = &result {
            tracing::warn!(course, roll, error = %e, "registration rejected");
        }
        result
    }

    /// Explicitly overwrite an existing student's name and embedding.
    pub async fn reregister(
        &self,
        course: &str,
        roll: &str,
        name: &str,
        image: Vec<u8>,
    ) -> Result<Student, EngineError> {
        let (new, entry) = self.prepare_student(course, roll, name, image).await?;
        self.commit_identity(new, entry, true).await
    }

    /// Soft-delete a student and drop it from the course index.
    pub async fn deactivate(&self, course: &str, roll: &str) -> Result<bool, EngineError> {
        let course = self.course(course)?;
        let roll = RollNumber::parse(roll)?;

        let guard = Arc::clone(&self.writes).lock_owned().await;
        let identities = self.identities.clone();
        let index = Arc::clone(&self.index);
        blocking(move || {
            let _guard = guard;
            let changed = identities.deactivate(&course, &roll)?;
            index.remove(&course, &roll);
            Ok(changed)
        })
        .await
    }

    /// Rebuild one course index from the identity store and publish it.
    /// Returns the number of indexed students.
    pub async fn rebuild(&self, course: &str) -> Result<usize, EngineError> {
        let course = self.course(course)?;
        self.rebuild_course(course).await
    }

    /// Rebuild every catalog course, e.g. at process start.
    pub async fn rebuild_all(&self) -> Result<usize, EngineError> {
        let mut total = 0;
        for course in self.catalog.codes().cloned().collect::<Vec<_>>() {
            total += self.rebuild_course(course).await?;
        }
        tracing::info!(courses = self.catalog.len(), students = total, "all course indices built");
        Ok(total)
    }

    // --- Recognition ---

    /// Match every face in a photo against the course and record
    /// attendance for confident, unambiguous matches. Failures are per
    /// face and never abort the rest of the batch.
    pub async fn process_photo(&self, course: &str, image: Vec<u8>) -> Result<PhotoReport, EngineError> {
        let course = self.course(course)?;
        let detections = self.embed(image).await?;
        let batch_id = Uuid::new_v4();

        tracing::info!(%batch_id, course = %course, faces = detections.len(), "processing photo");

        let mut results = Vec::with_capacity(detections.len());
        for (face, detection) in detections.into_iter().enumerate() {
            let result = self.match_face(&course, face, detection).await;
            tracing::debug!(
                %batch_id,
                face,
                roll = ?result.roll,
                confidence = result.confidence,
                detection_score = result.detection_score,
                action = ?result.action,
                "face processed"
            );
            results.push(result);
        }

        let report = PhotoReport {
            batch_id,
            course,
            results,
        };
        tracing::info!(
            %batch_id,
            recorded = report.recorded(),
            faces = report.results.len(),
            "photo processed"
        );
        Ok(report)
    }

    // --- Reads ---

    pub async fn attendance(
        &self,
        course: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<AttendanceRecord>, EngineError> {
        let course = self.course(course)?;
        if from > to {
            return Err(EngineError::InvalidInput(format!("date range {from}..{to} is reversed")));
        }
        let ledger = self.ledger.clone();
        blocking(move || Ok(ledger.query(&course, from, to)?)).await
    }

    pub async fn summary(&self, course: &str, date: NaiveDate) -> Result<DailySummary, EngineError> {
        let course = self.course(course)?;
        let ledger = self.ledger.clone();
        blocking(move || Ok(ledger.summary(&course, date)?)).await
    }

    pub async fn student(&self, course: &str, roll: &str) -> Result<StudentInfo, EngineError> {
        let course = self.course(course)?;
        let roll = RollNumber::parse(roll)?;
        let identities = self.identities.clone();
        let student = blocking(move || Ok(identities.get(&course, &roll)?)).await?;
        Ok(student.into())
    }

    pub async fn list_students(&self, course: &str) -> Result<Vec<StudentInfo>, EngineError> {
        let course = self.course(course)?;
        let identities = self.identities.clone();
        let students = blocking(move || Ok(identities.list_all(&course)?)).await?;
        Ok(students.into_iter().map(StudentInfo::from).collect())
    }

    // --- Corrections ---

    /// Remove one day's attendance for a student. Returns whether a
    /// record existed.
    pub async fn retract(&self, course: &str, roll: &str, date: NaiveDate) -> Result<bool, EngineError> {
        let course = self.course(course)?;
        let roll = RollNumber::parse(roll)?;
        let ledger = self.ledger.clone();
        blocking(move || Ok(ledger.retract(&course, &roll, date)?)).await
    }

    /// Delete every record of a course dated before `date`.
    pub async fn purge_before(&self, course: &str, date: NaiveDate) -> Result<usize, EngineError> {
        let course = self.course(course)?;
        let ledger = self.ledger.clone();
        blocking(move || Ok(ledger.purge_before(&course, date)?)).await
    }

    pub fn index_stats(&self) -> Vec<CourseStats> {
        self.index.stats()
    }

    pub fn status(&self) -> serde_json::Value {
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "courses": self.catalog.iter().collect::<Vec<_>>(),
            "indices": self.index_stats(),
            "model_version": self.settings.model_version,
            "embedding_dim": self.settings.embedding_dim,
            "similarity_threshold": self.settings.matcher.threshold,
            "ambiguity_margin": self.settings.matcher.ambiguity_margin,
            "utc_offset": self.settings.institution_offset.to_string(),
        })
    }

    // --- Internals ---

    fn course(&self, code: &str) -> Result<CourseCode, EngineError> {
        Ok(self.catalog.get(&CourseCode::new(code))?.code.clone())
    }

    async fn prepare_student(
        &self,
        course: &str,
        roll: &str,
        name: &str,
        image: Vec<u8>,
    ) -> Result<(NewStudent, IndexEntry), EngineError> {
        let course = self.course(course)?;
        let roll = RollNumber::parse(roll)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(EngineError::InvalidInput("student name is empty".into()));
        }

        let embedding = self.embed_single(image).await?;
        // Validate before anything is written so the index update after
        // the commit cannot fail.
        let entry = self.index.prepare(roll.clone(), &embedding)?;

        Ok((
            NewStudent {
                course,
                roll,
                name: name.to_string(),
                embedding,
            },
            entry,
        ))
    }

    async fn commit_identity(
        &self,
        new: NewStudent,
        entry: IndexEntry,
        overwrite: bool,
    ) -> Result<Student, EngineError> {
        let guard = Arc::clone(&self.writes).lock_owned().await;
        let identities = self.identities.clone();
        let index = Arc::clone(&self.index);
        blocking(move || {
            let _guard = guard;
            let student = if overwrite {
                identities.reregister(&new)?
            } else {
                identities.register(&new)?
            };
            if index.snapshot(&new.course).is_some() {
                index.insert_entry(&new.course, entry);
            } else {
                // Never published: a one-entry snapshot would hide the
                // course's other students.
                match indexable_students(&identities, &index, &new.course) {
                    Ok(entries) => {
                        index.rebuild(&new.course, entries);
                    }
                    Err(e) => tracing::warn!(
                        course = %new.course,
                        error = %e,
                        "course index left unpublished; it is rebuilt on first query"
                    ),
                }
            }
            Ok(student)
        })
        .await
    }

    async fn rebuild_course(&self, course: CourseCode) -> Result<usize, EngineError> {
        let guard = Arc::clone(&self.writes).lock_owned().await;
        let identities = self.identities.clone();
        let index = Arc::clone(&self.index);
        blocking(move || {
            let _guard = guard;
            let entries = indexable_students(&identities, &index, &course)?;
            Ok(index.rebuild(&course, entries).entries)
        })
        .await
    }

    async fn embed(&self, image: Vec<u8>) -> Result<Vec<Detection>, EngineError> {
        let provider = Arc::clone(&self.provider);
        tokio::time::timeout(
            self.settings.embed_timeout,
            blocking(move || Ok(provider.embed(&image)?)),
        )
        .await
        .map_err(|_| EngineError::Timeout("embedding extraction"))?
    }

    async fn embed_single(&self, image: Vec<u8>) -> Result<Embedding, EngineError> {
        let mut detections = self.embed(image).await?;
        match detections.len() {
            0 => Err(EngineError::NoFaceDetected),
            1 => Ok(detections.remove(0).embedding),
            n => Err(EngineError::MultipleFacesAmbiguous(n)),
        }
    }

    async fn match_face(&self, course: &CourseCode, face: usize, detection: Detection) -> MatchResult {
        let detection_score = detection.score;
        let failed = |roll: Option<RollNumber>, confidence: f32, e: EngineError| MatchResult {
            face,
            roll,
            confidence,
            detection_score,
            action: MatchAction::Failed {
                error: format!("{}: {e}", e.kind()),
            },
        };

        let candidates = match self.query(course, detection.embedding).await {
            Ok(c) => c,
            Err(e) => return failed(None, 0.0, e),
        };

        match self.settings.matcher.decide(&candidates) {
            Decision::Match(Candidate { roll, similarity }) => {
                match self.record(course, &roll, similarity).await {
                    Ok(outcome) => MatchResult {
                        face,
                        roll: Some(roll),
                        confidence: similarity,
                        detection_score,
                        action: MatchAction::Recorded { outcome },
                    },
                    Err(e) => failed(Some(roll), similarity, e),
                }
            }
            Decision::Unrecognized { best_similarity } => MatchResult {
                face,
                roll: None,
                confidence: best_similarity,
                detection_score,
                action: MatchAction::Unrecognized,
            },
            Decision::Ambiguous { candidates } => {
                tracing::warn!(
                    course = %course,
                    face,
                    candidates = ?candidates.iter().map(|c| c.roll.as_str()).collect::<Vec<_>>(),
                    "ambiguous match; not recorded"
                );
                MatchResult {
                    face,
                    roll: None,
                    confidence: candidates.first().map_or(0.0, |c| c.similarity),
                    detection_score,
                    action: MatchAction::Ambiguous { candidates },
                }
            }
        }
    }

    /// Index lookup with timeout. A course whose index has not been
    /// published yet is rebuilt from the identity store once, then retried.
    async fn query(&self, course: &CourseCode, probe: Embedding) -> Result<Vec<Candidate>, EngineError> {
        match self.query_once(course, probe.clone()).await {
            Err(EngineError::IndexUnavailable(_)) => {
                tracing::warn!(course = %course, "index not published; rebuilding from identity store");
                tokio::time::timeout(self.settings.query_timeout, self.rebuild_course(course.clone()))
                    .await
                    .map_err(|_| EngineError::IndexUnavailable(course.clone()))??;
                self.query_once(course, probe).await
            }
            other => other,
        }
    }

    async fn query_once(&self, course: &CourseCode, probe: Embedding) -> Result<Vec<Candidate>, EngineError> {
        let index = Arc::clone(&self.index);
        let course = course.clone();
        let k = self.settings.top_k.max(MIN_CANDIDATES);
        let threshold = self.settings.matcher.threshold;
        tokio::time::timeout(
            self.settings.query_timeout,
            blocking(move || Ok(index.query(&course, &probe, k, threshold)?)),
        )
        .await
        .map_err(|_| EngineError::Timeout("index query"))?
    }

    /// Ledger write; a storage failure is retried once after a backoff.
    /// A committed write stays committed even if the request goes away.
    async fn record(
        &self,
        course: &CourseCode,
        roll: &RollNumber,
        confidence: f32,
    ) -> Result<RecordOutcome, EngineError> {
        let timestamp = (self.clock)();
        let attempt = || {
            #[cfg(test)]
            self.ledger_attempts
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let ledger = self.ledger.clone();
            let course = course.clone();
            let roll = roll.clone();
            blocking(move || Ok(ledger.record(&course, &roll, timestamp, confidence)?))
        };

        match attempt().await {
            Err(EngineError::StorageFailure(e)) => {
                tracing::warn!(course = %course, roll = %roll, error = %e, "ledger write failed; retrying once");
                tokio::time::sleep(self.settings.storage_retry_backoff).await;
                attempt().await
            }
            other => other,
        }
    }
}

/// Index entries for every active student of a course. Students whose
/// stored embedding the index rejects are skipped with a warning.
fn indexable_students(
    identities: &IdentityStore,
    index: &VectorIndex,
    course: &CourseCode,
) -> Result<Vec<IndexEntry>, StoreError> {
    let students = identities.list(course)?;
    let mut entries = Vec::with_capacity(students.len());
    for student in students {
        match index.prepare(student.roll.clone(), &student.embedding) {
            Ok(entry) => entries.push(entry),
            Err(e) => tracing::warn!(
                course = %course,
                roll = %student.roll,
                error = %e,
                "student not indexed; re-register with the current model"
            ),
        }
    }
    Ok(entries)
}

/// Run blocking store/index work off the async runtime.
async fn blocking<T, F>(f: F) -> Result<T, EngineError>
where
    F: FnOnce() -> Result<T, EngineError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| EngineError::Internal(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;

    const DIM: usize = 4;
    const VERSION: &str = "test-arcface";

    /// Provider that returns canned faces for registered photo keys.
    struct FakeProvider {
        photos: std::sync::Mutex<HashMap<Vec<u8>, Vec<Vec<f32>>>>,
        version: String,
        delay: Duration,
    }

    impl FakeProvider {
        fn new() -> Self {
            Self::with_version(VERSION)
        }

        fn with_version(version: &str) -> Self {
            Self {
                photos: std::sync::Mutex::new(HashMap::new()),
                version: version.to_string(),
                delay: Duration::ZERO,
            }
        }

        fn photo(&self, key: &str, faces: Vec<Vec<f32>>) -> Vec<u8> {
            let bytes = key.as_bytes().to_vec();
            self.photos.lock().unwrap().insert(bytes.clone(), faces);
            bytes
        }
    }

    impl EmbeddingProvider for FakeProvider {
        fn embed(&self, image: &[u8]) -> Result<Vec<Detection>, ProviderError> {
            std::thread::sleep(self.delay);
            let faces = self
                .photos
                .lock()
                .unwrap()
                .get(image)
                .cloned()
                .ok_or_else(|| ProviderError::Decode("unknown photo".into()))?;
            Ok(faces
                .into_iter()
                .map(|values| Detection {
                    embedding: Embedding::new(values, self.version.clone()),
                    score: 0.99,
                })
                .collect())
        }

        fn dimension(&self) -> usize {
            DIM
        }

        fn model_version(&self) -> &str {
            &self.version
        }
    }

    fn settings() -> EngineSettings {
        EngineSettings {
            matcher: ThresholdMatcher {
                threshold: 0.4,
                ambiguity_margin: 0.02,
            },
            embedding_dim: DIM,
            model_version: VERSION.to_string(),
            top_k: 5,
            institution_offset: FixedOffset::east_opt(0).unwrap(),
            embed_timeout: Duration::from_secs(2),
            query_timeout: Duration::from_secs(2),
            storage_retry_backoff: Duration::from_millis(10),
        }
    }

    fn nine_am() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 6, 9, 0, 0).unwrap()
    }

    fn engine_on(db: &Database, provider: Arc<FakeProvider>) -> MatchEngine {
        MatchEngine::new(CourseCatalog::builtin().unwrap(), provider, db, settings())
            .unwrap()
            .with_clock(nine_am)
    }

    fn setup() -> (MatchEngine, Arc<FakeProvider>) {
        let provider = Arc::new(FakeProvider::new());
        let db = Database::open_in_memory().unwrap();
        (engine_on(&db, Arc::clone(&provider)), provider)
    }

    fn v(values: [f32; DIM]) -> Vec<f32> {
        values.to_vec()
    }

    async fn enroll(engine: &MatchEngine, provider: &FakeProvider, course: &str, roll: &str, values: [f32; DIM]) {
        let photo = provider.photo(&format!("enroll-{course}-{roll}"), vec![v(values)]);
        engine.register(course, roll, &format!("Student {roll}"), photo).await.unwrap();
    }

    #[tokio::test]
    async fn test_registered_student_recognized_with_full_similarity() {
        let (engine, provider) = setup();
        engine.rebuild_all().await.unwrap();
        enroll(&engine, &provider, "AI", "1001", [0.1, 0.2, 0.3, 0.4]).await;

        let photo = provider.photo("probe", vec![v([0.1, 0.2, 0.3, 0.4])]);
        let report = engine.process_photo("AI", photo).await.unwrap();
        assert_eq!(report.results.len(), 1);
        let r = &report.results[0];
        assert_eq!(r.roll.as_ref().map(|r| r.as_str()), Some("1001"));
        assert!((r.confidence - 1.0).abs() < 1e-5);
        assert!(matches!(
            r.action,
            MatchAction::Recorded { outcome: RecordOutcome::Inserted }
        ));
        assert!((r.detection_score - 0.99).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_other_course_never_matches() {
        let (engine, provider) = setup();
        enroll(&engine, &provider, "AI", "1001", [1.0, 0.0, 0.0, 0.0]).await;

        // GD has never been published: the engine rebuilds it on demand.
        let photo = provider.photo("probe", vec![v([1.0, 0.0, 0.0, 0.0])]);
        let report = engine.process_photo("GD", photo).await.unwrap();
        assert_eq!(report.results.len(), 1);
        assert!(report.results[0].roll.is_none());
        assert!(matches!(report.results[0].action, MatchAction::Unrecognized));
        assert_eq!(engine.index_stats().len(), 2);
    }

    #[tokio::test]
    async fn test_group_photo_records_each_confident_face() {
        let (engine, provider) = setup();
        engine.rebuild_all().await.unwrap();
        enroll(&engine, &provider, "AI", "1", [1.0, 0.0, 0.0, 0.0]).await;
        enroll(&engine, &provider, "AI", "2", [0.0, 1.0, 0.0, 0.0]).await;
        enroll(&engine, &provider, "AI", "3", [0.0, 0.0, 1.0, 0.0]).await;

        let photo = provider.photo(
            "group",
            vec![
                v([0.95, 0.05, 0.0, 0.0]),
                v([0.0, 0.0, 0.0, 1.0]),
                v([0.05, 0.95, 0.0, 0.0]),
            ],
        );
        let report = engine.process_photo("AI", photo).await.unwrap();
        assert_eq!(report.recorded(), 2);
        assert!(matches!(report.results[1].action, MatchAction::Unrecognized));
        assert_eq!(report.results[0].roll.as_ref().unwrap().as_str(), "1");
        assert_eq!(report.results[2].roll.as_ref().unwrap().as_str(), "2");

        let day = engine.today();
        let rows = engine.attendance("AI", day, day).await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn test_near_tie_flagged_not_recorded() {
        let (engine, provider) = setup();
        engine.rebuild_all().await.unwrap();
        enroll(&engine, &provider, "GD", "10", [0.7, 0.7, 0.1, 0.0]).await;
        enroll(&engine, &provider, "GD", "11", [0.7, 0.7, 0.0, 0.1]).await;

        let photo = provider.photo("probe", vec![v([1.0, 1.0, 0.0, 0.0])]);
        let report = engine.process_photo("GD", photo).await.unwrap();
        match &report.results[0].action {
            MatchAction::Ambiguous { candidates } => {
                let rolls: Vec<_> = candidates.iter().map(|c| c.roll.as_str()).collect();
                assert_eq!(rolls, ["10", "11"]);
            }
            other => panic!("expected ambiguous, got {other:?}"),
        }
        assert!(report.results[0].roll.is_none());

        let day = engine.today();
        assert!(engine.attendance("GD", day, day).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_repeat_detection_same_day_keeps_one_row() {
        let (engine, provider) = setup();
        engine.rebuild_all().await.unwrap();
        enroll(&engine, &provider, "AI", "1001", [1.0, 0.0, 0.0, 0.0]).await;

        let weak = provider.photo("weak", vec![v([0.8, 0.6, 0.0, 0.0])]);
        let strong = provider.photo("strong", vec![v([1.0, 0.1, 0.0, 0.0])]);

        let first = engine.process_photo("AI", weak.clone()).await.unwrap();
        let second = engine.process_photo("AI", strong).await.unwrap();
        let third = engine.process_photo("AI", weak).await.unwrap();
        assert!(matches!(first.results[0].action, MatchAction::Recorded { outcome: RecordOutcome::Inserted }));
        assert!(matches!(second.results[0].action, MatchAction::Recorded { outcome: RecordOutcome::Updated }));
        assert!(matches!(third.results[0].action, MatchAction::Recorded { outcome: RecordOutcome::Unchanged }));

        let day = engine.today();
        let rows = engine.attendance("AI", day, day).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!((rows[0].confidence - second.results[0].confidence).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_registration_requires_exactly_one_face() {
        let (engine, provider) = setup();
        let none = provider.photo("none", vec![]);
        let two = provider.photo("two", vec![v([1.0, 0.0, 0.0, 0.0]), v([0.0, 1.0, 0.0, 0.0])]);

        assert!(matches!(
            engine.register("AI", "1", "A", none).await,
            Err(EngineError::NoFaceDetected)
        ));
        assert!(matches!(
            engine.register("AI", "1", "A", two).await,
            Err(EngineError::MultipleFacesAmbiguous(2))
        ));
        assert!(engine.list_students("AI").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_registration_rejections_leave_no_partial_state() {
        let (engine, provider) = setup();
        engine.rebuild_all().await.unwrap();
        let good = provider.photo("good", vec![v([1.0, 0.0, 0.0, 0.0])]);
        let short = provider.photo("short", vec![vec![1.0, 0.0]]);
        let zero = provider.photo("zero", vec![v([0.0; DIM])]);

        assert!(matches!(
            engine.register("XX", "1", "A", good.clone()).await,
            Err(EngineError::UnknownCourse(_))
        ));
        assert!(matches!(
            engine.register("AI", "12a", "A", good.clone()).await,
            Err(EngineError::InvalidRollNumber(_))
        ));
        assert!(matches!(
            engine.register("AI", "1", "A", short).await,
            Err(EngineError::InvalidEmbedding(_))
        ));
        assert!(matches!(
            engine.register("AI", "1", "A", zero).await,
            Err(EngineError::InvalidEmbedding(_))
        ));
        assert!(engine.list_students("AI").await.unwrap().is_empty());
        assert_eq!(engine.index_stats()[0].entries, 0);

        engine.register("AI", "1", "A", good.clone()).await.unwrap();
        let err = engine.register("AI", "1", "B", good).await.unwrap_err();
        assert!(matches!(err, EngineError::DuplicateIdentity { .. }));
        assert_eq!(err.kind(), "DuplicateIdentity");
        assert_eq!(engine.list_students("AI").await.unwrap()[0].name, "A");
        assert_eq!(engine.index_stats()[0].entries, 1);
    }

    #[tokio::test]
    async fn test_reregister_replaces_embedding() {
        let (engine, provider) = setup();
        engine.rebuild_all().await.unwrap();
        enroll(&engine, &provider, "AI", "7", [1.0, 0.0, 0.0, 0.0]).await;

        let new_face = provider.photo("new-face", vec![v([0.0, 0.0, 1.0, 0.0])]);
        engine.reregister("AI", "7", "Seven", new_face.clone()).await.unwrap();

        let old = provider.photo("old-probe", vec![v([1.0, 0.0, 0.0, 0.0])]);
        let report = engine.process_photo("AI", old).await.unwrap();
        assert!(matches!(report.results[0].action, MatchAction::Unrecognized));

        let report = engine.process_photo("AI", new_face).await.unwrap();
        assert_eq!(report.results[0].roll.as_ref().unwrap().as_str(), "7");

        let missing = provider.photo("missing", vec![v([0.0, 1.0, 0.0, 0.0])]);
        assert!(matches!(
            engine.reregister("AI", "8", "Eight", missing).await,
            Err(EngineError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_deactivated_student_not_matched_but_listed() {
        let (engine, provider) = setup();
        engine.rebuild_all().await.unwrap();
        enroll(&engine, &provider, "AI", "1", [1.0, 0.0, 0.0, 0.0]).await;

        assert!(engine.deactivate("AI", "1").await.unwrap());
        assert!(!engine.deactivate("AI", "1").await.unwrap());
        assert!(matches!(
            engine.deactivate("AI", "2").await,
            Err(EngineError::NotFound { .. })
        ));

        let probe = provider.photo("probe", vec![v([1.0, 0.0, 0.0, 0.0])]);
        let report = engine.process_photo("AI", probe).await.unwrap();
        assert!(matches!(report.results[0].action, MatchAction::Unrecognized));

        let listed = engine.list_students("AI").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(!listed[0].active);
        assert_eq!(engine.rebuild("AI").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_per_face_failure_does_not_abort_batch() {
        let (engine, provider) = setup();
        engine.rebuild_all().await.unwrap();
        enroll(&engine, &provider, "AI", "1", [1.0, 0.0, 0.0, 0.0]).await;

        let photo = provider.photo("mixed", vec![vec![1.0, 0.0], v([1.0, 0.0, 0.0, 0.0])]);
        let report = engine.process_photo("AI", photo).await.unwrap();
        match &report.results[0].action {
            MatchAction::Failed { error } => assert!(error.starts_with("InvalidEmbedding")),
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(report.results[1].is_recorded());
    }

    #[tokio::test]
    async fn test_photo_without_faces_yields_no_results() {
        let (engine, provider) = setup();
        let photo = provider.photo("empty-room", vec![]);
        let report = engine.process_photo("AI", photo).await.unwrap();
        assert!(report.results.is_empty());
    }

    #[tokio::test]
    async fn test_slow_provider_times_out() {
        let provider = Arc::new(FakeProvider {
            delay: Duration::from_millis(300),
            ..FakeProvider::new()
        });
        let db = Database::open_in_memory().unwrap();
        let mut s = settings();
        s.embed_timeout = Duration::from_millis(20);
        let engine =
            MatchEngine::new(CourseCatalog::builtin().unwrap(), provider.clone(), &db, s).unwrap();

        let photo = provider.photo("slow", vec![v([1.0, 0.0, 0.0, 0.0])]);
        let err = engine.process_photo("AI", photo).await.unwrap_err();
        assert!(matches!(err, EngineError::Timeout(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_provider_mismatch_refuses_to_start() {
        let db = Database::open_in_memory().unwrap();
        let provider = Arc::new(FakeProvider::with_version("other-model"));
        let err = MatchEngine::new(CourseCatalog::builtin().unwrap(), provider, &db, settings())
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Misconfigured(_)));

        let mut s = settings();
        s.embedding_dim = 512;
        let err = MatchEngine::new(
            CourseCatalog::builtin().unwrap(),
            Arc::new(FakeProvider::new()),
            &db,
            s,
        )
        .err()
        .unwrap();
        assert!(matches!(err, EngineError::Misconfigured(_)));
    }

    #[tokio::test]
    async fn test_index_rebuilt_from_store_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attendance.db");
        let provider = Arc::new(FakeProvider::new());
        {
            let db = Database::open(&path).unwrap();
            let engine = engine_on(&db, Arc::clone(&provider));
            enroll(&engine, &provider, "AI", "1001", [0.0, 1.0, 0.0, 0.0]).await;
        }

        let db = Database::open(&path).unwrap();
        let engine = engine_on(&db, Arc::clone(&provider));
        assert_eq!(engine.rebuild_all().await.unwrap(), 1);

        let probe = provider.photo("probe", vec![v([0.0, 1.0, 0.0, 0.0])]);
        let report = engine.process_photo("AI", probe).await.unwrap();
        assert!(report.results[0].is_recorded());
    }

    #[tokio::test]
    async fn test_students_from_other_model_version_are_not_indexed() {
        let db = Database::open_in_memory().unwrap();
        let old_provider = Arc::new(FakeProvider::with_version("old-model"));
        let mut old_settings = settings();
        old_settings.model_version = "old-model".into();
        let old = MatchEngine::new(
            CourseCatalog::builtin().unwrap(),
            old_provider.clone(),
            &db,
            old_settings,
        )
        .unwrap();
        let photo = old_provider.photo("enroll", vec![v([1.0, 0.0, 0.0, 0.0])]);
        old.register("AI", "1", "Old", photo).await.unwrap();

        let engine = engine_on(&db, Arc::new(FakeProvider::new()));
        assert_eq!(engine.rebuild_all().await.unwrap(), 0);
        assert_eq!(engine.list_students("AI").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_summary_and_status() {
        let (engine, provider) = setup();
        engine.rebuild_all().await.unwrap();
        enroll(&engine, &provider, "AI", "1", [1.0, 0.0, 0.0, 0.0]).await;
        enroll(&engine, &provider, "AI", "2", [0.0, 1.0, 0.0, 0.0]).await;

        let probe = provider.photo("probe", vec![v([1.0, 0.0, 0.0, 0.0])]);
        engine.process_photo("AI", probe).await.unwrap();

        let summary = engine.summary("AI", engine.today()).await.unwrap();
        assert_eq!((summary.present, summary.total), (1, 2));

        let status = engine.status();
        assert_eq!(status["embedding_dim"], DIM);
        assert_eq!(status["indices"].as_array().unwrap().len(), 2);
        assert_eq!(status["courses"][0]["code"], "AI");
    }

    #[tokio::test]
    async fn test_retract_and_purge() {
        let (engine, provider) = setup();
        engine.rebuild_all().await.unwrap();
        enroll(&engine, &provider, "AI", "1", [1.0, 0.0, 0.0, 0.0]).await;
        let probe = provider.photo("probe", vec![v([1.0, 0.0, 0.0, 0.0])]);
        engine.process_photo("AI", probe).await.unwrap();

        let day = engine.today();
        assert!(engine.retract("AI", "1", day).await.unwrap());
        assert!(engine.attendance("AI", day, day).await.unwrap().is_empty());
        assert_eq!(engine.purge_before("AI", day).await.unwrap(), 0);

        let info = engine.student("AI", "1").await.unwrap();
        assert_eq!(info.model_version, VERSION);
        assert!(matches!(
            engine.student("AI", "2").await,
            Err(EngineError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_reversed_range_rejected() {
        let (engine, _) = setup();
        let day = engine.today();
        let err = engine
            .attendance("AI", day.succ_opt().unwrap(), day)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_near_tie_flagged_with_single_candidate_setting() {
        let provider = Arc::new(FakeProvider::new());
        let db = Database::open_in_memory().unwrap();
        let mut s = settings();
        s.top_k = 1;
        let engine = MatchEngine::new(CourseCatalog::builtin().unwrap(), provider.clone(), &db, s)
            .unwrap()
            .with_clock(nine_am);
        engine.rebuild_all().await.unwrap();
        enroll(&engine, &provider, "GD", "10", [0.7, 0.7, 0.1, 0.0]).await;
        enroll(&engine, &provider, "GD", "11", [0.7, 0.7, 0.0, 0.1]).await;

        let photo = provider.photo("probe", vec![v([1.0, 1.0, 0.0, 0.0])]);
        let report = engine.process_photo("GD", photo).await.unwrap();
        match &report.results[0].action {
            MatchAction::Ambiguous { candidates } => assert_eq!(candidates.len(), 2),
            other => panic!("expected ambiguous, got {other:?}"),
        }
        let day = engine.today();
        assert!(engine.attendance("GD", day, day).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_first_registration_after_restart_keeps_stored_students() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attendance.db");
        let provider = Arc::new(FakeProvider::new());
        {
            let db = Database::open(&path).unwrap();
            let engine = engine_on(&db, Arc::clone(&provider));
            enroll(&engine, &provider, "AI", "1001", [0.0, 1.0, 0.0, 0.0]).await;
        }

        // No rebuild_all: the registration is the first write to AI.
        let db = Database::open(&path).unwrap();
        let engine = engine_on(&db, Arc::clone(&provider));
        enroll(&engine, &provider, "AI", "1002", [0.0, 0.0, 1.0, 0.0]).await;
        let snapshot = engine.index.snapshot(&CourseCode::new("AI")).unwrap();
        assert_eq!(snapshot.len(), 2);

        let probe = provider.photo("probe", vec![v([0.0, 1.0, 0.0, 0.0])]);
        let report = engine.process_photo("AI", probe).await.unwrap();
        assert_eq!(report.results[0].roll.as_ref().unwrap().as_str(), "1001");
        assert!(report.results[0].is_recorded());
    }

    /// Engine on a file database plus a second connection to tamper with it.
    async fn engine_with_side_connection(
        dir: &tempfile::TempDir,
        backoff: Duration,
    ) -> (MatchEngine, Arc<FakeProvider>, rusqlite::Connection) {
        let path = dir.path().join("attendance.db");
        let provider = Arc::new(FakeProvider::new());
        let db = Database::open(&path).unwrap();
        let mut s = settings();
        s.storage_retry_backoff = backoff;
        let engine = MatchEngine::new(CourseCatalog::builtin().unwrap(), provider.clone(), &db, s)
            .unwrap()
            .with_clock(nine_am);
        engine.rebuild_all().await.unwrap();
        enroll(&engine, &provider, "AI", "1", [1.0, 0.0, 0.0, 0.0]).await;
        let side = rusqlite::Connection::open(&path).unwrap();
        side.busy_timeout(Duration::from_secs(5)).unwrap();
        (engine, provider, side)
    }

    #[tokio::test]
    async fn test_ledger_failure_retried_once_then_reported() {
        let dir = tempfile::tempdir().unwrap();
        let backoff = Duration::from_millis(50);
        let (engine, provider, side) = engine_with_side_connection(&dir, backoff).await;
        side.execute_batch("ALTER TABLE attendance RENAME TO attendance_moved")
            .unwrap();

        let probe = provider.photo("probe", vec![v([1.0, 0.0, 0.0, 0.0])]);
        let started = std::time::Instant::now();
        let report = engine.process_photo("AI", probe).await.unwrap();

        let r = &report.results[0];
        assert_eq!(r.roll.as_ref().unwrap().as_str(), "1");
        match &r.action {
            MatchAction::Failed { error } => assert!(error.starts_with("StorageFailure")),
            other => panic!("expected storage failure, got {other:?}"),
        }
        assert_eq!(engine.ledger_attempts.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert!(started.elapsed() >= backoff);
    }

    #[tokio::test]
    async fn test_ledger_write_recovers_on_retry() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, provider, side) =
            engine_with_side_connection(&dir, Duration::from_millis(400)).await;
        side.execute_batch("ALTER TABLE attendance RENAME TO attendance_moved")
            .unwrap();

        let probe = provider.photo("probe", vec![v([1.0, 0.0, 0.0, 0.0])]);
        // Restored while the engine waits out the backoff.
        let restore = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            side.execute_batch("ALTER TABLE attendance_moved RENAME TO attendance")
                .unwrap();
        };
        let (report, ()) = tokio::join!(engine.process_photo("AI", probe), restore);

        let report = report.unwrap();
        assert!(matches!(
            report.results[0].action,
            MatchAction::Recorded { outcome: RecordOutcome::Inserted }
        ));
        assert_eq!(engine.ledger_attempts.load(std::sync::atomic::Ordering::SeqCst), 2);
        let day = engine.today();
        assert_eq!(engine.attendance("AI", day, day).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unpublished_course_rebuild_timeout_reports_unavailable() {
        let provider = Arc::new(FakeProvider::new());
        let db = Database::open_in_memory().unwrap();
        let mut s = settings();
        s.query_timeout = Duration::from_millis(50);
        let engine =
            MatchEngine::new(CourseCatalog::builtin().unwrap(), provider.clone(), &db, s).unwrap();

        // An identity write in progress keeps the on-demand rebuild waiting.
        let _writer = engine.writes.lock().await;
        let probe = provider.photo("probe", vec![v([1.0, 0.0, 0.0, 0.0])]);
        let report = engine.process_photo("GD", probe).await.unwrap();

        match &report.results[0].action {
            MatchAction::Failed { error } => assert!(error.starts_with("IndexUnavailable")),
            other => panic!("expected unavailable index, got {other:?}"),
        }
        assert!(engine.index.snapshot(&CourseCode::new("GD")).is_none());
    }
}

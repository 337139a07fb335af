use serde::{Deserialize, Serialize};

/// Fixed category weights used by the final blend. These are applied as-is
/// regardless of how many categories actually carry data, so the effective
/// distribution shifts as categories are added. Intentional: the published
/// grading behavior depends on it.
pub const ASSIGNMENTS_WEIGHT: f64 = 30.0;
pub const QUIZZES_WEIGHT: f64 = 20.0;
pub const MIDTERM_WEIGHT: f64 = 25.0;
pub const FINAL_EXAM_WEIGHT: f64 = 25.0;

/// 2-decimal rounding used for every stored percentage.
pub fn round_off_2_decimals(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new("validation_failed", message)
    }
}

/// One scored, weighted item in a repeating category (assignment or quiz).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreComponent {
    pub title: String,
    pub max_score: f64,
    pub score: f64,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

fn default_weight() -> f64 {
    1.0
}

impl Default for ScoreComponent {
    fn default() -> Self {
        Self {
            title: String::new(),
            max_score: 100.0,
            score: 0.0,
            weight: 1.0,
            date: None,
            feedback: None,
        }
    }
}

/// A non-repeating scored item (midterm, final exam, participation).
/// `score` stays None until the item has been graded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixedComponent {
    pub max_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

impl Default for FixedComponent {
    fn default() -> Self {
        Self {
            max_score: 100.0,
            score: None,
        }
    }
}

/// The raw inputs of one grade record, as handed over by the write handler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeComponents {
    #[serde(default)]
    pub assignments: Vec<ScoreComponent>,
    #[serde(default)]
    pub quizzes: Vec<ScoreComponent>,
    #[serde(default)]
    pub midterm: FixedComponent,
    #[serde(default)]
    pub final_exam: FixedComponent,
    #[serde(default)]
    pub participation: FixedComponent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LetterGrade {
    #[serde(rename = "A+")]
    APlus,
    #[serde(rename = "A")]
    A,
    #[serde(rename = "A-")]
    AMinus,
    #[serde(rename = "B+")]
    BPlus,
    #[serde(rename = "B")]
    B,
    #[serde(rename = "B-")]
    BMinus,
    #[serde(rename = "C+")]
    CPlus,
    #[serde(rename = "C")]
    C,
    #[serde(rename = "C-")]
    CMinus,
    #[serde(rename = "D+")]
    DPlus,
    #[serde(rename = "D")]
    D,
    #[serde(rename = "D-")]
    DMinus,
    #[serde(rename = "F")]
    F,
}

impl LetterGrade {
    pub fn as_str(&self) -> &'static str {
        match self {
            LetterGrade::APlus => "A+",
            LetterGrade::A => "A",
            LetterGrade::AMinus => "A-",
            LetterGrade::BPlus => "B+",
            LetterGrade::B => "B",
            LetterGrade::BMinus => "B-",
            LetterGrade::CPlus => "C+",
            LetterGrade::C => "C",
            LetterGrade::CMinus => "C-",
            LetterGrade::DPlus => "D+",
            LetterGrade::D => "D",
            LetterGrade::DMinus => "D-",
            LetterGrade::F => "F",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalGrade {
    pub percentage: f64,
    pub letter_grade: LetterGrade,
    pub gpa: f64,
}

fn check_finite(value: f64, what: &str, title: &str) -> Result<(), CalcError> {
    if !value.is_finite() {
        return Err(CalcError::validation(format!(
            "{} must be a finite number in '{}'",
            what, title
        )));
    }
    Ok(())
}

fn validate_score_component(c: &ScoreComponent) -> Result<(), CalcError> {
    check_finite(c.max_score, "maxScore", &c.title)?;
    check_finite(c.score, "score", &c.title)?;
    check_finite(c.weight, "weight", &c.title)?;
    if c.max_score <= 0.0 {
        return Err(CalcError::validation(format!(
            "maxScore must be > 0 in '{}'",
            c.title
        )));
    }
    if c.score < 0.0 {
        return Err(CalcError::validation(format!(
            "score must be >= 0 in '{}'",
            c.title
        )));
    }
    if c.weight < 0.0 {
        return Err(CalcError::validation(format!(
            "weight must be >= 0 in '{}'",
            c.title
        )));
    }
    Ok(())
}

fn validate_fixed_component(c: &FixedComponent, what: &str) -> Result<(), CalcError> {
    let Some(score) = c.score else {
        return Ok(());
    };
    check_finite(c.max_score, "maxScore", what)?;
    check_finite(score, "score", what)?;
    if c.max_score <= 0.0 {
        return Err(CalcError::validation(format!(
            "maxScore must be > 0 for {}",
            what
        )));
    }
    if score < 0.0 {
        return Err(CalcError::validation(format!(
            "score must be >= 0 for {}",
            what
        )));
    }
    Ok(())
}

/// Weighted average of one repeating category, as a percentage.
/// `Σ(score/maxScore × weight) / Σ(weight) × 100`; total weight 0 yields 0.
pub fn category_average(components: &[ScoreComponent]) -> Result<f64, CalcError> {
    let mut weighted_sum = 0.0_f64;
    let mut total_weight = 0.0_f64;
    for c in components {
        validate_score_component(c)?;
        weighted_sum += (c.score / c.max_score) * c.weight;
        total_weight += c.weight;
    }
    if total_weight <= 0.0 {
        return Ok(0.0);
    }
    Ok(weighted_sum / total_weight * 100.0)
}

fn fixed_percentage(c: &FixedComponent, what: &str) -> Result<Option<f64>, CalcError> {
    validate_fixed_component(c, what)?;
    Ok(c.score.map(|s| s / c.max_score * 100.0))
}

/// Blend the categories that carry data using the fixed weight table.
///
/// A repeating category counts as present only when its total weight is
/// positive, so an empty list or a list of weight-0 items never enters the
/// blend. A fixed category counts as present once its score is set.
/// Participation is validated but not blended; it rides along on the record.
pub fn final_percentage(components: &GradeComponents) -> Result<f64, CalcError> {
    validate_fixed_component(&components.participation, "participation")?;

    let mut numerator = 0.0_f64;
    let mut denominator = 0.0_f64;

    for c in &components.assignments {
        validate_score_component(c)?;
    }
    let assignments_weight: f64 = components.assignments.iter().map(|c| c.weight).sum();
    if assignments_weight > 0.0 {
        let pct = category_average(&components.assignments)?;
        numerator += (pct / 100.0) * ASSIGNMENTS_WEIGHT;
        denominator += ASSIGNMENTS_WEIGHT;
    }

    for c in &components.quizzes {
        validate_score_component(c)?;
    }
    let quizzes_weight: f64 = components.quizzes.iter().map(|c| c.weight).sum();
    if quizzes_weight > 0.0 {
        let pct = category_average(&components.quizzes)?;
        numerator += (pct / 100.0) * QUIZZES_WEIGHT;
        denominator += QUIZZES_WEIGHT;
    }

    if let Some(pct) = fixed_percentage(&components.midterm, "midterm")? {
        numerator += (pct / 100.0) * MIDTERM_WEIGHT;
        denominator += MIDTERM_WEIGHT;
    }

    if let Some(pct) = fixed_percentage(&components.final_exam, "finalExam")? {
        numerator += (pct / 100.0) * FINAL_EXAM_WEIGHT;
        denominator += FINAL_EXAM_WEIGHT;
    }

    if denominator <= 0.0 {
        return Ok(0.0);
    }
    Ok(numerator / denominator * 100.0)
}

/// Highest-first threshold table; first match wins.
pub fn letter_grade(percentage: f64) -> LetterGrade {
    const TABLE: [(f64, LetterGrade); 12] = [
        (97.0, LetterGrade::APlus),
        (93.0, LetterGrade::A),
        (90.0, LetterGrade::AMinus),
        (87.0, LetterGrade::BPlus),
        (83.0, LetterGrade::B),
        (80.0, LetterGrade::BMinus),
        (77.0, LetterGrade::CPlus),
        (73.0, LetterGrade::C),
        (70.0, LetterGrade::CMinus),
        (67.0, LetterGrade::DPlus),
        (63.0, LetterGrade::D),
        (60.0, LetterGrade::DMinus),
    ];
    for (threshold, letter) in TABLE {
        if percentage >= threshold {
            return letter;
        }
    }
    LetterGrade::F
}

pub fn gpa(letter: LetterGrade) -> f64 {
    match letter {
        LetterGrade::APlus | LetterGrade::A => 4.0,
        LetterGrade::AMinus => 3.7,
        LetterGrade::BPlus => 3.3,
        LetterGrade::B => 3.0,
        LetterGrade::BMinus => 2.7,
        LetterGrade::CPlus => 2.3,
        LetterGrade::C => 2.0,
        LetterGrade::CMinus => 1.7,
        LetterGrade::DPlus => 1.3,
        LetterGrade::D => 1.0,
        LetterGrade::DMinus => 0.7,
        LetterGrade::F => 0.0,
    }
}

/// Derive the three final-grade fields in sequence. The caller writes all
/// three together with the components, inside the same transaction, so the
/// stored record can never carry a stale letter or gpa.
pub fn recompute(components: &GradeComponents) -> Result<FinalGrade, CalcError> {
    let percentage = round_off_2_decimals(final_percentage(components)?);
    let letter = letter_grade(percentage);
    Ok(FinalGrade {
        percentage,
        letter_grade: letter,
        gpa: gpa(letter),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Absent,
    Late,
    Excused,
    Suspended,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Absent => "absent",
            AttendanceStatus::Late => "late",
            AttendanceStatus::Excused => "excused",
            AttendanceStatus::Suspended => "suspended",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "present" => AttendanceStatus::Present,
            "absent" => AttendanceStatus::Absent,
            "late" => AttendanceStatus::Late,
            "excused" => AttendanceStatus::Excused,
            "suspended" => AttendanceStatus::Suspended,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceTally {
    pub present_count: i64,
    pub absent_count: i64,
    pub late_count: i64,
    pub excused_count: i64,
    pub suspended_count: i64,
}

pub fn tally<I>(statuses: I) -> AttendanceTally
where
    I: IntoIterator<Item = AttendanceStatus>,
{
    let mut t = AttendanceTally::default();
    for s in statuses {
        match s {
            AttendanceStatus::Present => t.present_count += 1,
            AttendanceStatus::Absent => t.absent_count += 1,
            AttendanceStatus::Late => t.late_count += 1,
            AttendanceStatus::Excused => t.excused_count += 1,
            AttendanceStatus::Suspended => t.suspended_count += 1,
        }
    }
    t
}

/// `(present + late) / (present + absent + late + excused) × 100`, rounded
/// to 2 decimals. Suspended rows are tracked but sit outside the formula.
pub fn attendance_percentage(t: &AttendanceTally) -> f64 {
    let denom = t.present_count + t.absent_count + t.late_count + t.excused_count;
    if denom == 0 {
        return 0.0;
    }
    let num = (t.present_count + t.late_count) as f64;
    round_off_2_decimals(num / (denom as f64) * 100.0)
}

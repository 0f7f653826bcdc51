//! Movement rule engine.
//!
//! Pure: callers load the student/class snapshot, the validator only decides.
//! Every rejection names the violated rule so the IPC layer can surface it
//! verbatim and tests can match on stable codes.

/// Grade scale. Declaration order is the promotion order: ECD < 1 < .. < 7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Grade {
    Ecd,
    G1,
    G2,
    G3,
    G4,
    G5,
    G6,
    G7,
}

impl Grade {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ECD" => Some(Self::Ecd),
            "1" => Some(Self::G1),
            "2" => Some(Self::G2),
            "3" => Some(Self::G3),
            "4" => Some(Self::G4),
            "5" => Some(Self::G5),
            "6" => Some(Self::G6),
            "7" => Some(Self::G7),
            _ => None,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Self::Ecd => "ECD",
            Self::G1 => "1",
            Self::G2 => "2",
            Self::G3 => "3",
            Self::G4 => "4",
            Self::G5 => "5",
            Self::G6 => "6",
            Self::G7 => "7",
        }
    }

    /// The grade a student advances into, or None from the terminal grade.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Ecd => Some(Self::G1),
            Self::G1 => Some(Self::G2),
            Self::G2 => Some(Self::G3),
            Self::G3 => Some(Self::G4),
            Self::G4 => Some(Self::G5),
            Self::G5 => Some(Self::G6),
            Self::G6 => Some(Self::G7),
            Self::G7 => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::G7)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovementType {
    Promotion,
    Demotion,
    Transfer,
    Graduation,
}

impl MovementType {
    pub fn code(self) -> &'static str {
        match self {
            Self::Promotion => "promotion",
            Self::Demotion => "demotion",
            Self::Transfer => "transfer",
            Self::Graduation => "graduation",
        }
    }
}

/// Snapshot of the student flags the rules depend on.
#[derive(Debug, Clone, Copy)]
pub struct StudentState {
    pub active: bool,
    pub graduated: bool,
}

/// Snapshot of a class as the rules see it.
#[derive(Debug, Clone)]
pub struct ClassRef {
    pub id: String,
    pub grade: Grade,
    pub year: i64,
}

#[derive(Debug, Clone)]
pub struct MovementRequest<'a> {
    pub movement_type: MovementType,
    pub student: StudentState,
    pub from: Option<&'a ClassRef>,
    pub to: Option<&'a ClassRef>,
    pub reason: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    StudentInactive,
    StudentGraduated,
    StudentUnassigned,
    TargetRequired,
    PromotionNotUpward,
    PromotionFromTerminalGrade,
    DemotionNotDownward,
    DemotionReasonRequired,
    TransferGradeMismatch,
    TransferYearMismatch,
    TransferSameClass,
    GraduationNotTerminal,
    GraduationHasTarget,
}

impl Rule {
    pub fn code(self) -> &'static str {
        match self {
            Self::StudentInactive => "student_inactive",
            Self::StudentGraduated => "student_graduated",
            Self::StudentUnassigned => "student_unassigned",
            Self::TargetRequired => "target_required",
            Self::PromotionNotUpward => "promotion_not_upward",
            Self::PromotionFromTerminalGrade => "promotion_from_terminal_grade",
            Self::DemotionNotDownward => "demotion_not_downward",
            Self::DemotionReasonRequired => "demotion_reason_required",
            Self::TransferGradeMismatch => "transfer_grade_mismatch",
            Self::TransferYearMismatch => "transfer_year_mismatch",
            Self::TransferSameClass => "transfer_same_class",
            Self::GraduationNotTerminal => "graduation_not_terminal",
            Self::GraduationHasTarget => "graduation_has_target",
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::StudentInactive => "student is not active",
            Self::StudentGraduated => "student has already graduated",
            Self::StudentUnassigned => "student has no current class assignment",
            Self::TargetRequired => "a target class is required",
            Self::PromotionNotUpward => {
                "promotion target grade must be higher than the current grade"
            }
            Self::PromotionFromTerminalGrade => {
                "students in the terminal grade graduate instead of being promoted"
            }
            Self::DemotionNotDownward => {
                "demotion target grade must be lower than the current grade"
            }
            Self::DemotionReasonRequired => "Reason is required for demotion",
            Self::TransferGradeMismatch => "transfer target must be in the same grade",
            Self::TransferYearMismatch => "transfer target must be in the same academic year",
            Self::TransferSameClass => "transfer target must be a different class",
            Self::GraduationNotTerminal => {
                "graduation is only permitted from the terminal grade"
            }
            Self::GraduationHasTarget => "graduation does not take a target class",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Approved,
    Rejected(Rule),
}

pub fn validate(req: &MovementRequest) -> Verdict {
    if !req.student.active {
        return Verdict::Rejected(Rule::StudentInactive);
    }
    if req.student.graduated {
        return Verdict::Rejected(Rule::StudentGraduated);
    }
    let Some(from) = req.from else {
        return Verdict::Rejected(Rule::StudentUnassigned);
    };

    match req.movement_type {
        MovementType::Promotion => {
            let Some(to) = req.to else {
                return Verdict::Rejected(Rule::TargetRequired);
            };
            if from.grade.is_terminal() {
                return Verdict::Rejected(Rule::PromotionFromTerminalGrade);
            }
            if to.grade <= from.grade {
                return Verdict::Rejected(Rule::PromotionNotUpward);
            }
        }
        MovementType::Demotion => {
            let Some(to) = req.to else {
                return Verdict::Rejected(Rule::TargetRequired);
            };
            if to.grade >= from.grade {
                return Verdict::Rejected(Rule::DemotionNotDownward);
            }
            if req.reason.map(str::trim).unwrap_or("").is_empty() {
                return Verdict::Rejected(Rule::DemotionReasonRequired);
            }
        }
        MovementType::Transfer => {
            let Some(to) = req.to else {
                return Verdict::Rejected(Rule::TargetRequired);
            };
            if to.grade != from.grade {
                return Verdict::Rejected(Rule::TransferGradeMismatch);
            }
            if to.year != from.year {
                return Verdict::Rejected(Rule::TransferYearMismatch);
            }
            if to.id == from.id {
                return Verdict::Rejected(Rule::TransferSameClass);
            }
        }
        MovementType::Graduation => {
            if req.to.is_some() {
                return Verdict::Rejected(Rule::GraduationHasTarget);
            }
            if !from.grade.is_terminal() {
                return Verdict::Rejected(Rule::GraduationNotTerminal);
            }
        }
    }

    Verdict::Approved
}

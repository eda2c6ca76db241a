use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the seven documents every experiment guide must contain.
///
/// The declaration order is the canonical reading order used by the HTML export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Document {
    ExperimentSynopsis,
    TheoryAndBackground,
    Methodology,
    DataTemplate,
    AnalysisAndConclusion,
    ReportTemplate,
    ReferencesAndResources,
}

impl Document {
    pub const ALL: [Document; 7] = [
        Document::ExperimentSynopsis,
        Document::TheoryAndBackground,
        Document::Methodology,
        Document::DataTemplate,
        Document::AnalysisAndConclusion,
        Document::ReportTemplate,
        Document::ReferencesAndResources,
    ];

    /// The file name the document is stored and exported under.
    pub fn file_name(self) -> &'static str {
        match self {
            Document::ExperimentSynopsis => "experiment_synopsis.md",
            Document::TheoryAndBackground => "theory_and_background.md",
            Document::Methodology => "methodology.md",
            Document::DataTemplate => "data_template.md",
            Document::AnalysisAndConclusion => "analysis_and_conclusion.md",
            Document::ReportTemplate => "report_template.md",
            Document::ReferencesAndResources => "references_and_resources.md",
        }
    }

    /// The file name without its `.md` extension; used as an HTML anchor.
    pub fn stem(self) -> &'static str {
        self.file_name().trim_end_matches(".md")
    }

    pub fn title(self) -> &'static str {
        match self {
            Document::ExperimentSynopsis => "Experiment Synopsis",
            Document::TheoryAndBackground => "Theory and Background",
            Document::Methodology => "Methodology",
            Document::DataTemplate => "Data Template",
            Document::AnalysisAndConclusion => "Analysis and Conclusion",
            Document::ReportTemplate => "Report Template",
            Document::ReferencesAndResources => "References and Resources",
        }
    }

    /// A one-line description of what belongs in the document, handed to the engine.
    pub fn purpose(self) -> &'static str {
        match self {
            Document::ExperimentSynopsis => {
                "short overview: title, research question, hypothesis, key concepts, timeline"
            }
            Document::TheoryAndBackground => {
                "physics principles, equations and real-world context at the student's level"
            }
            Document::Methodology => {
                "materials, safety precautions, setup and numbered procedure, troubleshooting"
            }
            Document::DataTemplate => "data tables with units, graph templates, calculation sheets",
            Document::AnalysisAndConclusion => {
                "how to analyse the data, expected trends, error analysis, conclusion framework"
            }
            Document::ReportTemplate => "complete science report structure to fill in",
            Document::ReferencesAndResources => "curated references, videos and further reading",
        }
    }

    pub fn from_file_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|doc| doc.file_name() == name)
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name())
    }
}

/// Returns the canonical documents absent from `names`, in canonical order.
pub fn missing_documents<'a, I>(names: I) -> Vec<Document>
where
    I: IntoIterator<Item = &'a str>,
{
    let present: Vec<&str> = names.into_iter().collect();
    Document::ALL
        .into_iter()
        .filter(|doc| !present.contains(&doc.file_name()))
        .collect()
}

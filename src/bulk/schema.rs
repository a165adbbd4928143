#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportField {
    AdmissionNumber,
    FirstName,
    LastName,
    DateOfBirth,
    Gender,
    ClassName,
    SectionName,
    RollNumber,
    Email,
    Phone,
    AdmissionDate,
    BloodGroup,
    GuardianName,
    GuardianRelation,
    GuardianPhone,
    GuardianEmail,
    AddressLine,
    City,
    State,
    PostalCode,
    Country,
}

#[derive(Debug, Clone, Copy)]
pub struct ImportColumn {
    pub field: ImportField,
    pub key: &'static str,
    pub label: &'static str,
    pub required: bool,
    pub sample: &'static str,
    pub note: &'static str,
}

impl ImportColumn {
    /// Header text as shown in the template; required columns end in `*`.
    pub fn header(&self) -> String {
        if self.required {
            format!("{} *", self.label)
        } else {
            self.label.to_string()
        }
    }
}

const fn col(
    field: ImportField,
    key: &'static str,
    label: &'static str,
    required: bool,
    sample: &'static str,
    note: &'static str,
) -> ImportColumn {
    ImportColumn {
        field,
        key,
        label,
        required,
        sample,
        note,
    }
}

pub const IMPORT_COLUMNS: [ImportColumn; 21] = [
    col(ImportField::AdmissionNumber, "admission_number", "Admission Number", true, "ADM-2026-001", "Unique per school."),
    col(ImportField::FirstName, "first_name", "First Name", true, "Aarav", ""),
    col(ImportField::LastName, "last_name", "Last Name", true, "Sharma", ""),
    col(ImportField::DateOfBirth, "date_of_birth", "Date of Birth", true, "2015-06-14", "YYYY-MM-DD, DD/MM/YYYY or DD-MM-YYYY."),
    col(ImportField::Gender, "gender", "Gender", true, "male", "male, female or other."),
    col(ImportField::ClassName, "class_name", "Class", true, "Grade 5", "Must match a class on the Classes sheet."),
    col(ImportField::SectionName, "section_name", "Section", true, "A", "Must be a section of the chosen class."),
    col(ImportField::RollNumber, "roll_number", "Roll Number", false, "12", ""),
    col(ImportField::Email, "email", "Email", false, "aarav@example.com", ""),
    col(ImportField::Phone, "phone", "Phone", false, "9876543210", ""),
    col(ImportField::AdmissionDate, "admission_date", "Admission Date", false, "2026-04-01", "Same formats as Date of Birth."),
    col(ImportField::BloodGroup, "blood_group", "Blood Group", false, "O+", ""),
    col(ImportField::GuardianName, "guardian_name", "Guardian Name", true, "Rohit Sharma", "First word becomes the first name."),
    col(ImportField::GuardianRelation, "guardian_relation", "Guardian Relation", false, "father", ""),
    col(ImportField::GuardianPhone, "guardian_phone", "Guardian Phone", true, "9876500000", ""),
    col(ImportField::GuardianEmail, "guardian_email", "Guardian Email", false, "rohit@example.com", ""),
    col(ImportField::AddressLine, "address_line", "Address", false, "12 MG Road", "Creates the current address when present."),
    col(ImportField::City, "city", "City", false, "Pune", ""),
    col(ImportField::State, "state", "State", false, "Maharashtra", ""),
    col(ImportField::PostalCode, "postal_code", "Postal Code", false, "411001", ""),
    col(ImportField::Country, "country", "Country", false, "India", ""),
];

pub const GENDERS: &[&str] = &["male", "female", "other"];

pub const GUARDIAN_RELATIONS: &[&str] = &["father", "mother", "guardian", "grandparent", "sibling", "other"];

pub const DATE_FORMATS: &[(&str, &str)] = &[
    ("%Y-%m-%d", "YYYY-MM-DD"),
    ("%d/%m/%Y", "DD/MM/YYYY"),
    ("%d-%m-%Y", "DD-MM-YYYY"),
];

pub fn column(field: ImportField) -> &'static ImportColumn {
    IMPORT_COLUMNS
        .iter()
        .find(|c| c.field == field)
        .unwrap_or(&IMPORT_COLUMNS[0])
}

pub fn position(field: ImportField) -> usize {
    IMPORT_COLUMNS
        .iter()
        .position(|c| c.field == field)
        .unwrap_or(0)
}

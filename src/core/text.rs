/// 去除拉丁字母重音 (葡語姓名常見字元)
pub fn unaccent(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            'á' | 'à' | 'â' | 'ã' | 'ä' | 'å' => 'a',
            'Á' | 'À' | 'Â' | 'Ã' | 'Ä' | 'Å' => 'A',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'É' | 'È' | 'Ê' | 'Ë' => 'E',
            'í' | 'ì' | 'î' | 'ï' => 'i',
            'Í' | 'Ì' | 'Î' | 'Ï' => 'I',
            'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
            'Ó' | 'Ò' | 'Ô' | 'Õ' | 'Ö' => 'O',
            'ú' | 'ù' | 'û' | 'ü' => 'u',
            'Ú' | 'Ù' | 'Û' | 'Ü' => 'U',
            'ç' => 'c',
            'Ç' => 'C',
            'ñ' => 'n',
            'Ñ' => 'N',
            'ý' | 'ÿ' => 'y',
            'Ý' => 'Y',
            other => other,
        })
        .collect()
}

/// trim + lower + 去重音
pub fn normalize(input: &str) -> String {
    unaccent(&input.trim().to_lowercase())
}

/// 第一個以空白分隔的字 (已正規化)
pub fn first_word(input: &str) -> Option<String> {
    normalize(input)
        .split(' ')
        .find(|w| !w.is_empty())
        .map(str::to_string)
}

/// "sao_paulo" → "Sao Paulo"
pub fn title_case(input: &str) -> String {
    input
        .split(|c: char| c == '_' || c == ' ')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// 診所名稱 → 檔名用的 snake case
pub fn clinic_slug(name: &str) -> String {
    name.trim().to_lowercase().replace(' ', "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unaccent_and_normalize() {
        assert_eq!(unaccent("João Antônio"), "Joao Antonio");
        assert_eq!(normalize("  CONCEIÇÃO "), "conceicao");
    }

    #[test]
    fn test_first_word() {
        assert_eq!(first_word("Maria  José da Silva"), Some("maria".to_string()));
        assert_eq!(first_word("   "), None);
    }

    #[test]
    fn test_title_case_and_slug() {
        assert_eq!(title_case("sao_paulo"), "Sao Paulo");
        assert_eq!(title_case("ibirapuera"), "Ibirapuera");
        assert_eq!(clinic_slug("Vila Mariana"), "vila_mariana");
    }
}

use std::collections::BTreeSet;

/// Tags trusted without a round trip to the tag index.
pub const FAST_PATH_TAGS: &[&str] = &[
    "shirakami_fubuki",
    "houshou_marine",
    "minato_aqua",
    "usada_pekora",
    "hatsune_miku",
    "megurine_luka",
    "kagamine_rin",
    "kagamine_len",
    "hu_tao_(genshin_impact)",
    "raiden_shogun_(genshin_impact)",
    "ganyu_(genshin_impact)",
    "keqing_(genshin_impact)",
];

/// Descriptors too generic to pick out anything on their own.
pub const WEAK_SEMANTIC_TAGS: &[&str] = &[
    "girl",
    "boy",
    "anime",
    "solo",
    "highres",
    "wallpaper",
    "cute",
];

pub const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
    "image", "picture", "photo", "search",
];

/// Phrase -> space-separated board tags. A phrase matches anywhere in the
/// lowercased input.
pub const TAG_MAPPINGS: &[(&str, &str)] = &[
    ("猫", "cat"),
    ("狗", "dog"),
    ("兔子", "rabbit"),
    ("狐狸", "fox"),
    ("狼", "wolf"),
    ("龙", "dragon"),
    ("天使", "angel"),
    ("恶魔", "demon"),
    ("魔法", "magic"),
    ("学校", "school"),
    ("泳装", "swimsuit"),
    ("和服", "kimono"),
    ("猫耳", "cat_ears"),
    ("尾巴", "tail"),
    ("可爱", "cute"),
    ("美少女", "beautiful_girl"),
    ("少年", "boy"),
    ("少女", "girl"),
    ("风景", "landscape"),
    ("夜景", "night"),
    ("樱花", "sakura cherry_blossom"),
    ("雨", "rain"),
    ("雪", "snow"),
    ("初音", "hatsune_miku"),
    ("未来", "hatsune_miku"),
    ("miku", "hatsune_miku"),
    ("天依", "luo_tianyi"),
    ("洛天依", "luo_tianyi"),
    ("言和", "yan_he"),
    ("乐正绫", "yuezheng_ling"),
    ("重音", "kasane_teto"),
    ("teto", "kasane_teto"),
    ("灵梦", "hakurei_reimu"),
    ("魔理沙", "kirisame_marisa"),
    ("春日步", "kasuga_ayumu"),
    ("大阪", "kasuga_ayumu"),
    ("芙兰", "flandre_scarlet"),
    ("蕾米", "remilia_scarlet"),
    ("爱蜜莉雅", "emilia_(re:zero)"),
    ("雷姆", "rem_(re:zero)"),
    ("拉姆", "ram_(re:zero)"),
    ("胡桃", "hu_tao_(genshin_impact)"),
    ("刻晴", "keqing_(genshin_impact)"),
    ("甘雨", "ganyu_(genshin_impact)"),
    ("纳西妲", "nahida_(genshin_impact)"),
    ("雷电将军", "raiden_shogun_(genshin_impact)"),
    ("一起", "multiple_girls"),
    ("合照", "multiple_girls"),
    ("白发", "white_hair"),
    ("黑发", "black_hair"),
    ("金发", "blonde_hair"),
    ("蓝发", "blue_hair"),
    ("红发", "red_hair"),
    ("绿发", "green_hair"),
    ("粉发", "pink_hair"),
    ("单人", "solo"),
    ("独照", "solo"),
    ("高清", "highres"),
    ("壁纸", "wallpaper"),
    ("大图", "highres"),
    ("萝莉", "loli"),
    ("御姐", "onee-san"),
    ("女仆", "maid"),
    ("护士", "nurse"),
    ("警察", "police"),
    ("医生", "doctor"),
    ("老师", "teacher"),
    ("学生", "student"),
    ("制服", "uniform"),
    ("水手服", "sailor_uniform"),
    ("运动服", "gym_uniform"),
    ("死库水", "school_swimsuit"),
    ("旗袍", "cheongsam"),
    ("哥特", "gothic"),
    ("洛丽塔", "lolita"),
    ("森林", "forest"),
    ("大海", "sea"),
    ("沙滩", "beach"),
    ("天空", "sky"),
    ("云", "clouds"),
    ("夕阳", "sunset"),
    ("星星", "stars"),
    ("月亮", "moon"),
    ("花", "flower"),
    ("城市", "city"),
    ("街道", "street"),
    ("室内", "indoor"),
    ("室外", "outdoor"),
    ("特写", "close-up"),
    ("全身", "full_body"),
    ("侧面", "profile"),
    ("背面", "back"),
    ("坐", "sitting"),
    ("站", "standing"),
    ("躺", "lying"),
    ("笑", "smile"),
    ("哭", "crying"),
    ("害羞", "blush"),
    ("生气", "angry"),
    ("睡觉", "sleeping"),
    ("吃", "eating"),
    ("喝", "drinking"),
    ("玩", "playing"),
    ("看", "looking_at_viewer"),
];

/// Deduplicated set of lowercase tags. Iteration order is stable but carries
/// no meaning.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagQuery {
    tags: BTreeSet<String>,
}

impl TagQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Splits a space-joined tag string back into a set.
    pub fn parse(joined: &str) -> Self {
        joined.split_whitespace().collect()
    }

    pub fn insert(&mut self, tag: &str) -> bool {
        let tag = tag.trim().to_lowercase();
        if tag.is_empty() {
            return false;
        }
        self.tags.insert(tag)
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.tags.iter().map(String::as_str)
    }

    pub fn join(&self) -> String {
        self.iter().collect::<Vec<&str>>().join(" ")
    }
}

impl<'a> FromIterator<&'a str> for TagQuery {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        let mut query = TagQuery::new();
        for tag in iter {
            query.insert(tag);
        }
        query
    }
}

pub fn extract_tags(text: &str) -> TagQuery {
    let mut query = TagQuery::new();
    if text.trim().is_empty() {
        return query;
    }
    let lowered = text.to_lowercase();

    for (phrase, mapped) in TAG_MAPPINGS {
        if lowered.contains(phrase) {
            for tag in mapped.split_whitespace() {
                query.insert(tag);
            }
        }
    }

    for word in lowered.split(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '_')) {
        if word.len() <= 2 {
            continue;
        }
        if word.chars().all(|ch| ch.is_ascii_digit()) {
            continue;
        }
        if STOP_WORDS.contains(&word) {
            continue;
        }
        query.insert(word);
    }

    query
}

pub fn is_fast_path_tag(tag: &str) -> bool {
    let lowered = tag.to_lowercase();
    FAST_PATH_TAGS.iter().any(|known| *known == lowered)
}

pub fn is_weak_semantic_tag(tag: &str) -> bool {
    let lowered = tag.to_lowercase();
    WEAK_SEMANTIC_TAGS.iter().any(|known| *known == lowered)
}
